use super::fixtures::{Fixture, TestDomain};
use crate::domain::{Domain, DomainEvent, VolumeConfig};
use crate::storage::{RESIZE_SERVICE, Storage, first_unused_frontend, resolve_source};
use crate::volume::VolumeMode;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vmdisk_core::StorageError;

const GIB: u64 = 1024 * 1024 * 1024;

fn template(name: &str) -> Arc<TestDomain> {
    Arc::new(
        TestDomain::new(name, "/nonexistent")
            .with_volume("root", VolumeConfig::origin().in_pool("mem2").with_size(10 * GIB))
            .with_volume("private", VolumeConfig::origin().with_size(2 * GIB)),
    )
}

fn app_vm(name: &str, template: &Arc<TestDomain>) -> Arc<TestDomain> {
    Arc::new(
        TestDomain::new(name, "/nonexistent")
            .with_template(template)
            .with_volume("root", VolumeConfig::snapshot())
            .with_volume("private", VolumeConfig::origin().with_size(2 * GIB))
            .with_volume("volatile", VolumeConfig::volatile().with_size(GIB)),
    )
}

#[test]
fn test_storage_is_cached_on_domain() {
    let fixture = Fixture::new();
    let vm = template("fedora");

    let first = fixture.storage(&vm);
    let second = fixture.storage(&vm);
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_snapshot_inherits_template_pool_and_size() {
    let fixture = Fixture::new();
    let tpl = template("fedora");
    let vm = app_vm("work", &tpl);

    let storage = fixture.storage(&vm);
    let root = storage.volume("root").unwrap();

    assert_eq!(root.pool(), "mem2");
    assert_eq!(root.size(), 10 * GIB);
    assert_eq!(root.mode(), VolumeMode::Snapshot);

    let template_root = fixture.storage(&tpl).volume("root").unwrap();
    assert_eq!(root.source().map(|s| s.vid()), Some(template_root.vid()));

    // volumes without a pool land in the default one
    assert_eq!(storage.volume("volatile").unwrap().pool(), "mem");
}

#[test]
fn test_chained_templates_resolve_to_origin() {
    let fixture = Fixture::new();
    let tpl = template("fedora");
    let app = app_vm("work", &tpl);
    let disp = Arc::new(
        TestDomain::new("disp1", "/nonexistent")
            .with_template(&app)
            .with_volume("root", VolumeConfig::snapshot()),
    );

    let disp_dyn: Arc<dyn Domain> = disp.clone();
    let resolved = resolve_source(&disp_dyn, "root", &fixture.host)
        .unwrap()
        .unwrap();
    assert_eq!(resolved.source.vid(), "fedora-root");
    assert_eq!(resolved.pool.name(), "mem2");
    assert_eq!(resolved.size, 10 * GIB);

    let root = fixture.storage(&disp).volume("root").unwrap();
    assert_eq!(root.source().map(|s| s.vid()), Some("fedora-root"));
}

#[test]
fn test_snapshot_without_template_is_rejected() {
    let fixture = Fixture::new();
    let vm: Arc<dyn Domain> =
        Arc::new(TestDomain::new("orphan", "/nonexistent").with_volume("root", VolumeConfig::snapshot()));

    let err = Storage::for_domain(&vm, &fixture.host).err().unwrap();
    assert!(matches!(err, StorageError::InvalidConfig { .. }));
}

#[test]
fn test_explicit_source_requires_pool() {
    let fixture = Fixture::new();
    let config = VolumeConfig {
        source: Some("fedora-root".to_string()),
        ..VolumeConfig::snapshot()
    };
    let vm: Arc<dyn Domain> =
        Arc::new(TestDomain::new("work", "/nonexistent").with_volume("root", config));

    let err = Storage::for_domain(&vm, &fixture.host).err().unwrap();
    assert!(err.to_string().contains("without a pool"));
}

#[test]
fn test_explicit_source_is_looked_up_in_pool() {
    let fixture = Fixture::new();
    let tpl = template("fedora");
    fixture.storage(&tpl);

    let config = VolumeConfig {
        source: Some("fedora-root".to_string()),
        ..VolumeConfig::snapshot().in_pool("mem2")
    };
    let vm = Arc::new(TestDomain::new("work", "/nonexistent").with_volume("root", config));

    let root = fixture.storage(&vm).volume("root").unwrap();
    assert_eq!(root.source().map(|s| s.vid()), Some("fedora-root"));
}

#[test]
fn test_unknown_pool_is_reported() {
    let fixture = Fixture::new();
    let vm: Arc<dyn Domain> = Arc::new(
        TestDomain::new("work", "/nonexistent")
            .with_volume("private", VolumeConfig::origin().in_pool("lvm")),
    );

    let err = Storage::for_domain(&vm, &fixture.host).err().unwrap();
    assert!(matches!(err, StorageError::PoolNotFound(name) if name == "lvm"));
}

#[tokio::test]
async fn test_start_runs_volumes_concurrently() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    fixture.recorder.set_delay(Duration::from_millis(50));

    storage.start().await.unwrap();

    let calls: Vec<_> = fixture
        .recorder
        .calls()
        .into_iter()
        .filter(|call| call.op == "start")
        .collect();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].overlaps(&calls[1]));
    assert!(calls[1].overlaps(&calls[2]));
}

#[tokio::test]
async fn test_failures_are_aggregated() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    fixture.recorder.fail("private", "stop");
    fixture.recorder.fail("volatile", "stop");

    let err = storage.stop().await.unwrap_err();

    assert_eq!(err.failures().len(), 2);
    assert_eq!(fixture.recorder.names("stop"), vec!["private", "root", "volatile"]);
}

#[tokio::test]
async fn test_single_failure_is_not_wrapped() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    fixture.recorder.fail("root", "create");

    let err = storage.create().await.unwrap_err();
    assert!(matches!(err, StorageError::Pool(_)));
    assert_eq!(fixture.recorder.names("create").len(), 3);
}

#[tokio::test]
async fn test_clone_imports_every_volume() {
    let fixture = Fixture::new();
    let dir = TempDir::new().unwrap();
    let src = template("fedora");
    let dst = Arc::new(
        TestDomain::new("fedora-clone", dir.path())
            .with_volume("root", VolumeConfig::origin().in_pool("mem2"))
            .with_volume("private", VolumeConfig::origin()),
    );
    let src_dyn: Arc<dyn Domain> = src.clone();

    let storage = fixture.storage(&dst);
    storage.clone_from_vm(&src_dyn).await.unwrap();

    assert_eq!(fixture.recorder.names("create"), vec!["private", "root"]);
    assert_eq!(fixture.recorder.names("import_volume"), vec!["private", "root"]);
    assert_eq!(storage.volumes().len(), 2);
}

#[tokio::test]
async fn test_failed_clone_cleans_up() {
    let fixture = Fixture::new();
    let dir = TempDir::new().unwrap();
    let vm_dir = dir.path().join("fedora-clone");
    std::fs::create_dir(&vm_dir).unwrap();

    let src = template("fedora");
    let dst = Arc::new(
        TestDomain::new("fedora-clone", &vm_dir)
            .with_volume("root", VolumeConfig::origin().in_pool("mem2"))
            .with_volume("private", VolumeConfig::origin()),
    );
    let src_dyn: Arc<dyn Domain> = src.clone();
    fixture.recorder.fail("private", "import_volume");

    let storage = fixture.storage(&dst);
    let err = storage.clone_from_vm(&src_dyn).await.unwrap_err();

    assert!(err.to_string().contains("import_volume failed"));
    // both volumes were created before the failure, both are gone again
    assert_eq!(fixture.recorder.names("remove"), vec!["private", "root"]);
    assert!(!vm_dir.exists());
}

#[tokio::test]
async fn test_failed_clone_ignores_cleanup_errors() {
    let fixture = Fixture::new();
    let dir = TempDir::new().unwrap();
    let vm_dir = dir.path().join("fedora-clone");
    std::fs::create_dir(&vm_dir).unwrap();

    let src = template("fedora");
    let dst = Arc::new(
        TestDomain::new("fedora-clone", &vm_dir)
            .with_volume("root", VolumeConfig::origin().in_pool("mem2"))
            .with_volume("private", VolumeConfig::origin()),
    );
    let src_dyn: Arc<dyn Domain> = src.clone();
    fixture.recorder.fail("private", "import_volume");
    fixture.recorder.fail("root", "remove");

    let storage = fixture.storage(&dst);
    let err = storage.clone_from_vm(&src_dyn).await.unwrap_err();

    // the import failure is reported, not the failed removal
    assert!(err.to_string().contains("import_volume failed"));
    assert!(!err.to_string().contains("remove"));
    assert_eq!(fixture.recorder.names("remove"), vec!["private", "root"]);
    assert!(!vm_dir.exists());
}

#[tokio::test]
async fn test_clone_volume_single() {
    let fixture = Fixture::new();
    let src = template("fedora");
    let dst = app_vm("work", &src);
    let src_dyn: Arc<dyn Domain> = src.clone();

    let storage = fixture.storage(&dst);
    let private = storage.clone_volume(&src_dyn, "private").await.unwrap();

    assert_eq!(private.vid(), "work-private");
    assert_eq!(fixture.recorder.names("import_volume"), vec!["private"]);
}

#[tokio::test]
async fn test_remove_never_fails() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    fixture.recorder.fail("private", "remove");

    storage.remove().await;

    assert_eq!(fixture.recorder.names("remove"), vec!["private", "root", "volatile"]);
}

#[tokio::test]
async fn test_verify_requires_vm_directory() {
    let fixture = Fixture::new();
    let dir = TempDir::new().unwrap();

    let missing = Arc::new(
        TestDomain::new("work", dir.path().join("missing"))
            .with_volume("private", VolumeConfig::origin()),
    );
    let err = fixture.storage(&missing).verify().await.unwrap_err();
    assert!(matches!(err, StorageError::DomainDirMissing { .. }));
    assert!(missing.events.lock().is_empty());

    let present = Arc::new(
        TestDomain::new("work2", dir.path()).with_volume("private", VolumeConfig::origin()),
    );
    fixture.storage(&present).verify().await.unwrap();
    assert_eq!(*present.events.lock(), vec![DomainEvent::VerifyFiles]);
}

#[tokio::test]
async fn test_outdated_volumes() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    fixture.recorder.mark_outdated("root");

    // a halted VM has nothing outdated
    assert!(storage.outdated_volumes().await.unwrap().is_empty());

    fixture.hypervisor.set_running("work");
    let outdated = storage.outdated_volumes().await.unwrap();
    assert_eq!(outdated.len(), 1);
    assert_eq!(outdated[0].name(), "root");
}

#[test]
fn test_first_unused_frontend() {
    let used: BTreeSet<String> = ["xvda", "xvdb", "xvdd"].iter().map(|s| s.to_string()).collect();
    assert_eq!(first_unused_frontend(&used).unwrap(), "xvdc");

    let all: BTreeSet<String> = ('a'..='z').map(|c| format!("xvd{c}")).collect();
    assert!(matches!(
        first_unused_frontend(&all),
        Err(StorageError::NoFreeFrontend)
    ));
}

#[tokio::test]
async fn test_attach_and_detach() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    let private = storage.volume("private").unwrap();

    let err = storage.attach(&private, true).await.unwrap_err();
    assert!(matches!(err, StorageError::DomainNotRunning(_)));

    fixture.hypervisor.set_running("work");
    storage.attach(&private, true).await.unwrap();
    // attaching again is a no-op
    storage.attach(&private, true).await.unwrap();

    let next = storage.unused_frontend().await.unwrap();
    assert_eq!(next, "xvdb");
    assert_eq!(storage.unused_frontend().await.unwrap(), next);

    let disks = fixture.hypervisor.disks("work");
    assert_eq!(disks.len(), 1);
    assert_eq!(disks[0].target, "xvda");
    assert_eq!(disks[0].source, "/dev/work-private");
    assert!(!disks[0].readonly);

    storage.detach(&private).await.unwrap();
    assert!(fixture.hypervisor.disks("work").is_empty());

    let err = storage.detach(&private).await.unwrap_err();
    assert!(matches!(err, StorageError::NotAttached(_)));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_concurrent_attach_uses_distinct_frontends() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    let private = storage.volume("private").unwrap();
    let volatile = storage.volume("volatile").unwrap();
    fixture.hypervisor.set_running("work");

    let (a, b) = tokio::join!(storage.attach(&private, true), storage.attach(&volatile, false));
    a.unwrap();
    b.unwrap();

    let targets: BTreeSet<String> = fixture
        .hypervisor
        .disks("work")
        .into_iter()
        .map(|disk| disk.target)
        .collect();
    assert_eq!(targets.len(), 2);
    assert_eq!(storage.used_frontends().await.unwrap(), targets);
}

#[tokio::test]
async fn test_resize_halted_vm() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);

    storage.resize("private", 4 * GIB).await.unwrap();

    assert_eq!(storage.volume("private").unwrap().size(), 4 * GIB);
    assert!(fixture.guest.calls.lock().is_empty());
}

#[tokio::test]
async fn test_resize_running_vm_grows_filesystem() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    let private = storage.volume("private").unwrap();
    fixture.hypervisor.set_running("work");

    storage.resize(&private, 4 * GIB).await.unwrap();

    let calls = fixture.guest.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].vm, "work");
    assert_eq!(calls[0].service, RESIZE_SERVICE);
    assert_eq!(calls[0].input, b"private");
    assert_eq!(calls[0].user, "root");
}

#[tokio::test]
async fn test_failed_online_resize_reports_guest_error() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);
    fixture.hypervisor.set_running("work");
    fixture.guest.fail_with(b"resize2fs: 100% \xffno space");

    let err = storage.resize("private", 4 * GIB).await.unwrap_err();

    assert!(matches!(err, StorageError::Capacity { .. }));
    let message = err.to_string();
    assert!(message.contains("you need to resize filesystem manually"));
    assert!(message.contains("resize2fs: 100 no space"));
    assert!(!message.contains('%'));
}

#[tokio::test]
async fn test_resize_unknown_volume() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);

    let err = storage.resize("swap", GIB).await.unwrap_err();
    assert!(matches!(err, StorageError::VolumeNotFound(_)));
}

#[tokio::test]
async fn test_import_data_defaults_to_volume_size() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);

    let path = storage.import_data("private", None).await.unwrap();
    assert_eq!(path, PathBuf::from(format!("/mem/work-private.import.{}", 2 * GIB)));

    let path = storage.import_data("private", Some(GIB)).await.unwrap();
    assert!(path.to_string_lossy().ends_with(&GIB.to_string()));
    storage.import_data_end("private", true).await.unwrap();

    let exported = storage.export("private").await.unwrap();
    storage.export_end("private", &exported).await.unwrap();
    assert_eq!(exported, PathBuf::from("/mem/work-private"));
}

#[test]
fn test_kernels_dir() {
    let fixture = Fixture::new();
    let with_kernel = Arc::new(TestDomain::new("work", "/nonexistent").with_kernel("6.6.48"));
    let without = Arc::new(TestDomain::new("hvm", "/nonexistent"));

    assert_eq!(
        fixture.storage(&with_kernel).kernels_dir().unwrap(),
        Some(PathBuf::from("/var/lib/vmdisk/vm-kernels/6.6.48"))
    );
    assert_eq!(fixture.storage(&without).kernels_dir().unwrap(), None);
}

#[test]
fn test_empty_kernel_means_no_kernel() {
    let fixture = Fixture::new();
    let vm = Arc::new(TestDomain::new("work", "/nonexistent").with_kernel(""));

    assert_eq!(fixture.storage(&vm).kernels_dir().unwrap(), None);
}

#[test]
fn test_kernels_dir_from_kernel_volume() {
    let fixture = Fixture::new();
    let vm = Arc::new(
        TestDomain::new("work", "/nonexistent")
            .with_kernel("6.6.48")
            .with_volume("kernel", VolumeConfig::origin().with_size(GIB)),
    );

    assert_eq!(
        fixture.storage(&vm).kernels_dir().unwrap(),
        Some(PathBuf::from("/mem/work-kernel"))
    );
}

#[test]
fn test_disk_utilization_and_drive() {
    let fixture = Fixture::new();
    let vm = app_vm("work", &template("fedora"));
    let storage = fixture.storage(&vm);

    // memory volumes report half their size as used
    assert_eq!(storage.get_disk_utilization(), (10 * GIB + 2 * GIB + GIB) / 2);

    assert_eq!(storage.drive(), None);
    storage.set_drive(Some("cdrom:dom0:/tmp/install.iso".to_string()));
    assert_eq!(storage.drive().as_deref(), Some("cdrom:dom0:/tmp/install.iso"));
}

#[test]
fn test_default_pool_override_per_volume_name() {
    let mut config = super::fixtures::host_config("mem");
    config
        .default_pools
        .insert("private".to_string(), "mem2".to_string());
    let fixture = Fixture::with_config(config);

    let vm = Arc::new(
        TestDomain::new("work", "/nonexistent")
            .with_volume("private", VolumeConfig::origin())
            .with_volume("volatile", VolumeConfig::volatile()),
    );
    let storage = fixture.storage(&vm);

    assert_eq!(storage.volume("private").unwrap().pool(), "mem2");
    assert_eq!(storage.volume("volatile").unwrap().pool(), "mem");
}
