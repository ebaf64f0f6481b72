use crate::storage::Storage;
use crate::volume::{Volume, VolumeSpec};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use vmdisk_core::{ConfigMap, ConfigValue};

/// Notifications the storage layer sends to its VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEvent {
    /// All volumes passed verification.
    VerifyFiles,
}

/// The VM owning a set of volumes.
pub trait Domain: Send + Sync {
    fn name(&self) -> &str;

    /// Per-VM directory; must exist for storage verification to pass.
    fn dir_path(&self) -> PathBuf;

    /// Kernel version the VM boots, `None` when it boots its own.
    fn kernel(&self) -> Option<String> {
        None
    }

    /// VM this one takes snapshot sources from.
    fn template(&self) -> Option<Arc<dyn Domain>> {
        None
    }

    /// Declared volumes, by volume name.
    fn volume_config(&self) -> BTreeMap<String, VolumeConfig>;

    /// Slot caching this VM's [`Storage`], filled on first use.
    fn storage_cell(&self) -> &OnceCell<Arc<Storage>>;

    fn fire_event(&self, _event: DomainEvent) {}
}

/// Declared configuration of one VM volume.
///
/// An unset `pool` is inherited from the template chain or taken from the
/// host defaults. A `snap_on_start` volume without an explicit `source`
/// snapshots the same-named volume of its template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub pool: Option<String>,
    pub vid: Option<String>,
    pub size: Option<u64>,
    pub revisions_to_keep: Option<u32>,
    #[serde(default)]
    pub rw: bool,
    #[serde(default)]
    pub snap_on_start: bool,
    #[serde(default)]
    pub save_on_stop: bool,
    /// Vid of the source volume inside `pool`.
    pub source: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

const KNOWN_KEYS: &[&str] = &[
    "name",
    "pool",
    "vid",
    "size",
    "revisions_to_keep",
    "rw",
    "snap_on_start",
    "save_on_stop",
    "source",
];

impl VolumeConfig {
    pub fn volatile() -> Self {
        Self {
            rw: true,
            ..Default::default()
        }
    }

    pub fn snapshot() -> Self {
        Self {
            rw: true,
            snap_on_start: true,
            ..Default::default()
        }
    }

    pub fn origin() -> Self {
        Self {
            rw: true,
            save_on_stop: true,
            ..Default::default()
        }
    }

    pub fn origin_snapshot() -> Self {
        Self {
            rw: true,
            snap_on_start: true,
            save_on_stop: true,
            ..Default::default()
        }
    }

    pub fn in_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Reads a volume's config dictionary back, see [`Volume::config`].
    pub fn from_config_map(config: &ConfigMap) -> Self {
        let text = |key: &str| config.get(key).map(ToString::to_string);
        let flag = |key: &str| config.get(key).and_then(ConfigValue::as_bool).unwrap_or(false);

        Self {
            pool: text("pool"),
            vid: text("vid"),
            size: config.get("size").and_then(ConfigValue::as_u64),
            revisions_to_keep: config
                .get("revisions_to_keep")
                .and_then(ConfigValue::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
            rw: flag("rw"),
            snap_on_start: flag("snap_on_start"),
            save_on_stop: flag("save_on_stop"),
            source: text("source"),
            extra: config
                .iter()
                .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect(),
        }
    }

    /// Reads the persisted string form, where absent booleans mean `false`.
    pub fn from_sanitized(config: &BTreeMap<String, String>) -> Self {
        let map: ConfigMap = config
            .iter()
            .map(|(key, value)| (key.clone(), ConfigValue::Str(value.clone())))
            .collect();
        Self::from_config_map(&map)
    }

    pub(crate) fn to_spec(
        &self,
        name: &str,
        pool: &str,
        size: Option<u64>,
        source: Option<Arc<dyn Volume>>,
    ) -> VolumeSpec {
        let mut extra = self.extra.clone();
        // pre-1.0 configs carried an `internal` flag that no driver reads
        extra.remove("internal");

        VolumeSpec {
            name: name.to_string(),
            pool: pool.to_string(),
            vid: self.vid.clone(),
            revisions_to_keep: self.revisions_to_keep,
            rw: self.rw,
            save_on_stop: self.save_on_stop,
            snap_on_start: self.snap_on_start,
            size: size.or(self.size).unwrap_or(0),
            source,
            extra,
        }
    }
}
