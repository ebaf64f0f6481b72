use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use vmdisk_core::{BlockDevice, ConfigMap, ConfigValue, Result, StorageError};

/// Lifecycle variant of a volume, derived from `snap_on_start` and `save_on_stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeMode {
    /// Reset to an empty state on every start, nothing persists.
    Volatile,
    /// Starts from the source volume, changes are discarded on stop.
    Snapshot,
    /// Own data, persisted across stops.
    Origin,
    /// Starts from the source volume, changes are committed on stop.
    OriginSnapshot,
}

impl VolumeMode {
    pub fn from_flags(snap_on_start: bool, save_on_stop: bool) -> Self {
        match (snap_on_start, save_on_stop) {
            (false, false) => VolumeMode::Volatile,
            (true, false) => VolumeMode::Snapshot,
            (false, true) => VolumeMode::Origin,
            (true, true) => VolumeMode::OriginSnapshot,
        }
    }

    pub fn snap_on_start(self) -> bool {
        matches!(self, VolumeMode::Snapshot | VolumeMode::OriginSnapshot)
    }

    pub fn save_on_stop(self) -> bool {
        matches!(self, VolumeMode::Origin | VolumeMode::OriginSnapshot)
    }
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeMode::Volatile => write!(f, "volatile"),
            VolumeMode::Snapshot => write!(f, "snapshot"),
            VolumeMode::Origin => write!(f, "origin"),
            VolumeMode::OriginSnapshot => write!(f, "origin_snapshot"),
        }
    }
}

/// Resolved input from which a pool constructs a volume.
///
/// `vid` and `revisions_to_keep` may be left unset; the pool then picks its
/// own identifier scheme and default.
#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub name: String,
    pub pool: String,
    pub vid: Option<String>,
    pub revisions_to_keep: Option<u32>,
    pub rw: bool,
    pub save_on_stop: bool,
    pub snap_on_start: bool,
    pub size: u64,
    pub source: Option<Arc<dyn Volume>>,
    /// Backend-specific keys, passed through untouched.
    pub extra: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn new(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: pool.into(),
            ..Default::default()
        }
    }

    pub fn mode(&self) -> VolumeMode {
        VolumeMode::from_flags(self.snap_on_start, self.save_on_stop)
    }
}

/// Attributes shared by every volume regardless of backend.
pub struct VolumeInfo {
    name: String,
    pool: String,
    vid: String,
    revisions_to_keep: u32,
    rw: bool,
    save_on_stop: bool,
    snap_on_start: bool,
    size: AtomicU64,
    source: Option<Arc<dyn Volume>>,
}

impl VolumeInfo {
    /// Validates the snapshot invariants of `spec` and fixes the volume identity.
    pub fn new(spec: &VolumeSpec, vid: String, revisions_to_keep: u32) -> Result<Self> {
        match (&spec.source, spec.snap_on_start) {
            (None, true) => {
                return Err(StorageError::InvalidConfig {
                    volume: spec.name.clone(),
                    message: "snap_on_start specified but no volume source set".to_string(),
                });
            }
            (Some(_), false) => {
                return Err(StorageError::InvalidConfig {
                    volume: spec.name.clone(),
                    message: "source specified but no snap_on_start set".to_string(),
                });
            }
            (Some(source), true) if source.pool() != spec.pool => {
                return Err(StorageError::InvalidConfig {
                    volume: spec.name.clone(),
                    message: format!(
                        "source volume {source:?} is not in pool {}",
                        spec.pool
                    ),
                });
            }
            _ => {}
        }

        Ok(Self {
            name: spec.name.clone(),
            pool: spec.pool.clone(),
            vid,
            revisions_to_keep,
            rw: spec.rw,
            save_on_stop: spec.save_on_stop,
            snap_on_start: spec.snap_on_start,
            size: AtomicU64::new(spec.size),
            source: spec.source.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn vid(&self) -> &str {
        &self.vid
    }

    pub fn revisions_to_keep(&self) -> u32 {
        self.revisions_to_keep
    }

    pub fn rw(&self) -> bool {
        self.rw
    }

    pub fn save_on_stop(&self) -> bool {
        self.save_on_stop
    }

    pub fn snap_on_start(&self) -> bool {
        self.snap_on_start
    }

    pub fn mode(&self) -> VolumeMode {
        VolumeMode::from_flags(self.snap_on_start, self.save_on_stop)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    pub fn source(&self) -> Option<&Arc<dyn Volume>> {
        self.source.as_ref()
    }

    /// `pool:vid`, the form used in error messages.
    pub fn id(&self) -> String {
        format!("{}:{}", self.pool, self.vid)
    }

    pub fn config(&self) -> ConfigMap {
        let mut config = ConfigMap::new();
        config.insert("name".to_string(), self.name.as_str().into());
        config.insert("pool".to_string(), self.pool.as_str().into());
        config.insert("vid".to_string(), self.vid.as_str().into());
        config.insert(
            "revisions_to_keep".to_string(),
            self.revisions_to_keep.into(),
        );
        config.insert("rw".to_string(), ConfigValue::Bool(self.rw));
        config.insert(
            "save_on_stop".to_string(),
            ConfigValue::Bool(self.save_on_stop),
        );
        config.insert(
            "snap_on_start".to_string(),
            ConfigValue::Bool(self.snap_on_start),
        );

        let size = self.size();
        if size > 0 {
            config.insert("size".to_string(), size.into());
        }
        if let Some(source) = &self.source {
            config.insert("source".to_string(), source.vid().into());
        }

        config
    }
}

impl fmt::Debug for VolumeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeInfo")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("vid", &self.vid)
            .field("mode", &self.mode())
            .field("size", &self.size())
            .finish()
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn unsupported<T: ?Sized>(method: &'static str) -> StorageError {
    StorageError::not_implemented(format!("Volume {}", short_type_name::<T>()), method)
}

/// Contract every storage backend volume fulfils.
///
/// Capabilities a backend does not provide report
/// [`StorageError::NotImplemented`], which callers may treat as an optional
/// feature being absent rather than as a failure.
#[async_trait]
pub trait Volume: Send + Sync {
    fn info(&self) -> &VolumeInfo;

    /// Materializes backing storage. Called exactly once per volume.
    async fn create(&self) -> Result<()> {
        Err(unsupported::<Self>("create"))
    }

    async fn remove(&self) -> Result<()> {
        Err(unsupported::<Self>("remove"))
    }

    /// Path to read point-in-time volume data from. While the owning VM runs
    /// this is the data from before it started.
    async fn export(&self) -> Result<PathBuf> {
        Err(unsupported::<Self>("export"))
    }

    /// Releases whatever [`Volume::export`] acquired. Must not fail.
    async fn export_end(&self, _path: &Path) {}

    /// Path to write `size` bytes of new volume data to.
    async fn import_data(&self, _size: u64) -> Result<PathBuf> {
        Err(unsupported::<Self>("import_data"))
    }

    /// Commits or discards an import; called whether or not it succeeded.
    async fn import_data_end(&self, _success: bool) -> Result<()> {
        Ok(())
    }

    async fn import_volume(&self, _src: &Arc<dyn Volume>) -> Result<()> {
        Err(unsupported::<Self>("import_volume"))
    }

    async fn is_dirty(&self) -> Result<bool> {
        Err(unsupported::<Self>("is_dirty"))
    }

    async fn is_outdated(&self) -> Result<bool> {
        Err(unsupported::<Self>("is_outdated"))
    }

    /// Grows the volume; shrinking fails with [`StorageError::Capacity`].
    async fn resize(&self, _size: u64) -> Result<()> {
        Err(unsupported::<Self>("resize"))
    }

    async fn revert(&self, _revision: Option<&str>) -> Result<()> {
        Err(unsupported::<Self>("revert"))
    }

    async fn start(&self) -> Result<()> {
        Err(unsupported::<Self>("start"))
    }

    async fn stop(&self) -> Result<()> {
        Err(unsupported::<Self>("stop"))
    }

    async fn verify(&self) -> Result<()> {
        Err(unsupported::<Self>("verify"))
    }

    /// Revision id to creation time, oldest first.
    async fn revisions(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        Ok(BTreeMap::new())
    }

    /// Bytes actually consumed, at most the volume size.
    fn usage(&self) -> u64 {
        0
    }

    fn path(&self) -> Option<PathBuf> {
        None
    }

    fn script(&self) -> Option<String> {
        None
    }

    /// Domain providing the backend device, if not the local host.
    fn backend_domain(&self) -> Option<String> {
        None
    }

    fn devtype(&self) -> &str {
        "disk"
    }

    fn kernels_dir(&self) -> Option<PathBuf> {
        None
    }

    fn block_device(&self) -> Option<BlockDevice> {
        let info = self.info();
        let path = self.path()?;
        Some(BlockDevice {
            path,
            name: info.name().to_string(),
            script: self.script(),
            rw: info.rw(),
            domain: self.backend_domain(),
            devtype: self.devtype().to_string(),
        })
    }

    fn config(&self) -> ConfigMap {
        self.info().config()
    }
}

impl dyn Volume {
    pub fn name(&self) -> &str {
        self.info().name()
    }

    pub fn pool(&self) -> &str {
        self.info().pool()
    }

    pub fn vid(&self) -> &str {
        self.info().vid()
    }

    pub fn size(&self) -> u64 {
        self.info().size()
    }

    pub fn mode(&self) -> VolumeMode {
        self.info().mode()
    }

    pub fn rw(&self) -> bool {
        self.info().rw()
    }

    pub fn source(&self) -> Option<&Arc<dyn Volume>> {
        self.info().source()
    }
}

impl PartialEq for dyn Volume {
    fn eq(&self, other: &Self) -> bool {
        self.pool() == other.pool() && self.vid() == other.vid()
    }
}

impl Eq for dyn Volume {}

impl Hash for dyn Volume {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pool().hash(state);
        self.vid().hash(state);
    }
}

impl fmt::Display for dyn Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vid())
    }
}

impl fmt::Debug for dyn Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}:{}'", self.pool(), self.vid())
    }
}
