pub mod collection;
pub mod domain;
pub mod drivers;
pub mod fanout;
pub mod file;
pub mod host;
pub mod locator;
pub mod lock;
pub mod pool;
pub mod storage;
pub mod volume;

#[cfg(test)]
mod tests;

pub use collection::{VolumeKey, VolumesCollection};
pub use domain::{Domain, DomainEvent, VolumeConfig};
pub use drivers::{DriverEntry, DriverRegistry, PoolFactory, builtin_drivers};
pub use fanout::{fan_out, fan_out_best_effort};
pub use file::{FilePool, FileVolume};
pub use host::Host;
pub use locator::{DirectoryThinPool, search_pool_containing_dir};
pub use lock::Locked;
pub use pool::Pool;
pub use storage::{RESIZE_SERVICE, ResolvedSource, Storage, VolumeRef, resolve_source};
pub use volume::{Volume, VolumeInfo, VolumeMode, VolumeSpec};

/// Names of the registered pool drivers.
pub fn pool_drivers() -> Vec<&'static str> {
    builtin_drivers().drivers()
}

/// Constructor parameters of `driver`, without the pool name.
pub fn driver_parameters(driver: &str) -> vmdisk_core::Result<Vec<&'static str>> {
    builtin_drivers().parameters(driver)
}
