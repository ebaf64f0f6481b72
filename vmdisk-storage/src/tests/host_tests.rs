use super::fixtures::{FakeGuest, FakeHypervisor, host_config};
use crate::drivers::{DriverRegistry, builtin_drivers};
use crate::host::Host;
use crate::{driver_parameters, pool_drivers};
use tempfile::TempDir;
use vmdisk_core::{PoolDefinition, StorageError};

fn empty_host() -> Host {
    Host::new(
        &host_config("default"),
        DriverRegistry::with_builtin(),
        FakeHypervisor::new(),
        FakeGuest::new(),
    )
    .unwrap()
}

#[test]
fn test_builtin_drivers() {
    assert_eq!(pool_drivers(), vec!["file"]);
    assert_eq!(
        driver_parameters("file").unwrap(),
        vec!["dir_path", "revisions_to_keep"]
    );
    assert!(matches!(
        builtin_drivers().parameters("lvm_thin"),
        Err(StorageError::DriverNotFound(_))
    ));
}

#[test]
fn test_instantiate_validates_options() {
    let registry = DriverRegistry::with_builtin();

    let unknown = PoolDefinition::new("file", "p1")
        .with_option("dir_path", "/tmp/p1")
        .with_option("thin_pool", "pool00");
    assert!(matches!(
        registry.instantiate(&unknown),
        Err(StorageError::ConfigError(_))
    ));

    let missing_dir = PoolDefinition::new("file", "p1");
    assert!(matches!(
        registry.instantiate(&missing_dir),
        Err(StorageError::ConfigError(_))
    ));

    let bad_revisions = PoolDefinition::new("file", "p1")
        .with_option("dir_path", "/tmp/p1")
        .with_option("revisions_to_keep", "many");
    assert!(registry.instantiate(&bad_revisions).is_err());

    let pool = registry
        .instantiate(
            &PoolDefinition::new("file", "p1")
                .with_option("dir_path", "/tmp/p1")
                .with_option("revisions_to_keep", "3"),
        )
        .unwrap();
    assert_eq!(pool.name(), "p1");
    assert_eq!(pool.driver(), "file");
    assert_eq!(pool.revisions_to_keep(), 3);
}

#[test]
fn test_host_from_config() {
    let dir = TempDir::new().unwrap();
    let mut config = host_config("varlibvmdisk");
    config.pools.push(
        PoolDefinition::new("file", "varlibvmdisk")
            .with_option("dir_path", dir.path().to_string_lossy()),
    );
    config.default_pools.insert("kernel".to_string(), "linux-kernel".to_string());

    let host = Host::new(
        &config,
        DriverRegistry::with_builtin(),
        FakeHypervisor::new(),
        FakeGuest::new(),
    )
    .unwrap();

    assert_eq!(host.get_pool("varlibvmdisk").unwrap().driver(), "file");
    assert!(matches!(
        host.get_pool("lvm"),
        Err(StorageError::PoolNotFound(_))
    ));
    assert_eq!(host.default_pool_for("root"), "varlibvmdisk");
    assert_eq!(host.default_pool_for("kernel"), "linux-kernel");
}

#[tokio::test]
async fn test_add_and_remove_pool() {
    let dir = TempDir::new().unwrap();
    let pool_dir = dir.path().join("pool");
    let host = empty_host();
    let definition =
        PoolDefinition::new("file", "p1").with_option("dir_path", pool_dir.to_string_lossy());

    host.add_pool(&definition).await.unwrap();
    assert!(pool_dir.is_dir());
    assert_eq!(host.pools().len(), 1);

    let err = host.add_pool(&definition).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));

    host.remove_pool("p1").await.unwrap();
    assert!(!pool_dir.exists());
    assert!(host.get_pool("p1").is_err());
}

#[tokio::test]
async fn test_containing_pool() {
    let dir = TempDir::new().unwrap();
    let host = empty_host();

    let outer = host
        .add_pool(
            &PoolDefinition::new("file", "outer")
                .with_option("dir_path", dir.path().to_string_lossy()),
        )
        .await
        .unwrap();
    let inner = host
        .add_pool(
            &PoolDefinition::new("file", "inner")
                .with_option("dir_path", dir.path().join("nested").to_string_lossy()),
        )
        .await
        .unwrap();

    let parent = host.containing_pool(inner.as_ref()).unwrap();
    assert_eq!(parent.name(), "outer");
    // the outer pool is not inside the nested one
    assert!(host.containing_pool(outer.as_ref()).is_none());
}
