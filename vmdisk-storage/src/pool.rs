use crate::collection::VolumesCollection;
use crate::domain::Domain;
use crate::host::Host;
use crate::volume::{Volume, VolumeSpec, short_type_name};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use vmdisk_core::{ConfigMap, Result, StorageError};

fn unsupported<T: ?Sized>(method: &'static str) -> StorageError {
    StorageError::not_implemented(format!("Pool driver {}", short_type_name::<T>()), method)
}

/// A storage backend instance managing a namespace of volumes.
///
/// Pools do not keep live volume objects; volumes are materialized on demand
/// by [`Pool::init_volume`], [`Pool::get_volume`] and [`Pool::list_volumes`].
/// A driver may implement only one of the two lookups, see
/// [`VolumesCollection`].
#[async_trait]
pub trait Pool: Send + Sync {
    fn name(&self) -> &str;

    fn driver(&self) -> &str;

    /// Default for volumes that do not set their own.
    fn revisions_to_keep(&self) -> u32 {
        1
    }

    /// Serializable identity of the pool, including its `name` and `driver`.
    fn config(&self) -> ConfigMap;

    /// Builds a volume for `vm` without touching the disk.
    fn init_volume(&self, vm: &dyn Domain, spec: VolumeSpec) -> Result<Arc<dyn Volume>>;

    /// Called once when the pool is added to the host.
    async fn setup(&self) -> Result<()> {
        Err(unsupported::<Self>("setup"))
    }

    /// Called once when the pool is removed from the host.
    async fn destroy(&self) -> Result<()> {
        Err(unsupported::<Self>("destroy"))
    }

    fn list_volumes(&self) -> Result<Vec<Arc<dyn Volume>>> {
        Err(unsupported::<Self>("list_volumes"))
    }

    /// Fails with [`StorageError::VolumeNotFound`] when `vid` is unknown.
    fn get_volume(&self, _vid: &str) -> Result<Arc<dyn Volume>> {
        Err(unsupported::<Self>("get_volume"))
    }

    /// Another pool of `host` whose storage physically contains this one.
    /// Best effort: `None` also means "cannot tell".
    fn included_in(&self, _host: &Host) -> Option<Arc<dyn Pool>> {
        None
    }

    /// Pool size in bytes, `None` if unknown.
    async fn size(&self) -> Option<u64> {
        None
    }

    /// Space used in the pool in bytes, `None` if unknown.
    async fn usage(&self) -> Option<u64> {
        None
    }

    /// `data_usage` and `data_size` where known; drivers may add more.
    async fn usage_details(&self) -> BTreeMap<String, u64> {
        let mut details = BTreeMap::new();
        if let Some(usage) = self.usage().await {
            details.insert("data_usage".to_string(), usage);
        }
        if let Some(size) = self.size().await {
            details.insert("data_size".to_string(), size);
        }
        details
    }

    /// Directory holding the pool data, for filesystem-backed drivers.
    fn dir_path(&self) -> Option<&Path> {
        None
    }

    /// `(volume_group, thin_pool)` for device-mapper thin drivers.
    fn thin_pool(&self) -> Option<(&str, &str)> {
        None
    }
}

impl dyn Pool {
    pub fn volumes(&self) -> VolumesCollection<'_> {
        VolumesCollection::new(self)
    }
}

impl PartialEq for dyn Pool {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for dyn Pool {}

impl Hash for dyn Pool {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

impl fmt::Display for dyn Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Debug for dyn Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({}, driver={})", self.name(), self.driver())
    }
}
