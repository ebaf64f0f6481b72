use crate::drivers::DriverRegistry;
use crate::pool::Pool;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vmdisk_core::{GuestService, HostConfig, Hypervisor, PoolDefinition, Result, StorageError};

/// Host-wide storage context: configured pools, defaults and the
/// hypervisor boundary shared by every VM's [`crate::Storage`].
pub struct Host {
    drivers: DriverRegistry,
    pools: RwLock<BTreeMap<String, Arc<dyn Pool>>>,
    default_pool: String,
    default_pools: HashMap<String, String>,
    kernels_dir: PathBuf,
    hypervisor: Arc<dyn Hypervisor>,
    guest: Arc<dyn GuestService>,
}

impl Host {
    /// Instantiates every pool listed in `config`. Pools are expected to be
    /// set up already; use [`Host::add_pool`] for new ones.
    pub fn new(
        config: &HostConfig,
        drivers: DriverRegistry,
        hypervisor: Arc<dyn Hypervisor>,
        guest: Arc<dyn GuestService>,
    ) -> Result<Self> {
        let mut pools = BTreeMap::new();
        for definition in &config.pools {
            let pool = drivers.instantiate(definition)?;
            pools.insert(pool.name().to_string(), pool);
        }
        debug!(
            hypervisor = hypervisor.name(),
            pools = pools.len(),
            default_pool = %config.default_pool,
            "Initialized storage host"
        );

        Ok(Self {
            drivers,
            pools: RwLock::new(pools),
            default_pool: config.default_pool.clone(),
            default_pools: config.default_pools.clone(),
            kernels_dir: config.kernels_dir.clone(),
            hypervisor,
            guest,
        })
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn guest(&self) -> &Arc<dyn GuestService> {
        &self.guest
    }

    pub fn kernels_dir(&self) -> &Path {
        &self.kernels_dir
    }

    pub fn get_pool(&self, name: &str) -> Result<Arc<dyn Pool>> {
        self.pools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::PoolNotFound(name.to_string()))
    }

    pub fn pools(&self) -> Vec<Arc<dyn Pool>> {
        self.pools.read().values().cloned().collect()
    }

    /// Registers an already constructed pool without running its setup.
    pub fn insert_pool(&self, pool: Arc<dyn Pool>) {
        self.pools.write().insert(pool.name().to_string(), pool);
    }

    /// Creates, sets up and registers a new pool.
    pub async fn add_pool(&self, definition: &PoolDefinition) -> Result<Arc<dyn Pool>> {
        if self.pools.read().contains_key(&definition.name) {
            return Err(StorageError::Pool(format!(
                "Pool {} already exists",
                definition.name
            )));
        }

        let pool = self.drivers.instantiate(definition)?;
        pool.setup().await?;
        self.insert_pool(pool.clone());

        info!(pool = %definition.name, driver = %definition.driver, "Added storage pool");
        Ok(pool)
    }

    /// Tears the pool down and forgets it.
    pub async fn remove_pool(&self, name: &str) -> Result<()> {
        let pool = self.get_pool(name)?;
        pool.destroy().await?;
        self.pools.write().remove(name);

        info!(pool = %name, "Removed storage pool");
        Ok(())
    }

    /// Pool used for a volume named `volume_name` when nothing else decides.
    pub fn default_pool_for(&self, volume_name: &str) -> &str {
        self.default_pools
            .get(volume_name)
            .map(String::as_str)
            .unwrap_or(&self.default_pool)
    }

    /// Pool physically containing `pool`'s storage, if any can be detected.
    pub fn containing_pool(&self, pool: &dyn Pool) -> Option<Arc<dyn Pool>> {
        let found = pool.included_in(self);
        if let Some(parent) = &found {
            if parent.name() == pool.name() {
                warn!(pool = %pool.name(), "Pool reported itself as its own container");
                return None;
            }
        }
        found
    }
}
