use crate::domain::{Domain, DomainEvent, VolumeConfig};
use crate::fanout::{fan_out, fan_out_best_effort};
use crate::host::Host;
use crate::pool::Pool;
use crate::volume::Volume;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use vmdisk_core::{DiskDescriptor, Result, StorageError};

/// Guest service that grows the filesystem after an online resize.
pub const RESIZE_SERVICE: &str = "vmdisk.ResizeDisk";

/// Frontend device names a volume can be attached as, in allocation order.
pub fn available_frontends() -> impl Iterator<Item = String> {
    ('a'..='z').map(|c| format!("xvd{c}"))
}

/// Lowest frontend name not in `used`.
pub fn first_unused_frontend(used: &BTreeSet<String>) -> Result<String> {
    available_frontends()
        .find(|frontend| !used.contains(frontend))
        .ok_or(StorageError::NoFreeFrontend)
}

/// A volume given either directly or by its name within the VM.
#[derive(Clone, Copy)]
pub enum VolumeRef<'a> {
    Name(&'a str),
    Volume(&'a Arc<dyn Volume>),
}

impl<'a> From<&'a str> for VolumeRef<'a> {
    fn from(name: &'a str) -> Self {
        VolumeRef::Name(name)
    }
}

impl<'a> From<&'a Arc<dyn Volume>> for VolumeRef<'a> {
    fn from(volume: &'a Arc<dyn Volume>) -> Self {
        VolumeRef::Volume(volume)
    }
}

/// Where a template-derived volume takes its data from.
pub struct ResolvedSource {
    pub source: Arc<dyn Volume>,
    pub pool: Arc<dyn Pool>,
    pub size: u64,
}

/// Walks the template chain of `vm` for the source of volume `name`.
///
/// Templates may be chained (template, then an app VM based on it, then a
/// disposable VM based on that); the source is the first volume up the chain
/// that is not itself a snapshot. Each ancestor's storage is initialized on
/// the way if needed.
pub fn resolve_source(
    vm: &Arc<dyn Domain>,
    name: &str,
    host: &Arc<Host>,
) -> Result<Option<ResolvedSource>> {
    let mut resolved = None;
    let mut template = vm.template();

    while let Some(current) = template {
        let storage = Storage::for_domain(&current, host)?;
        let source = storage.volume(name).ok_or_else(|| {
            StorageError::VolumeNotFound(format!("{}:{}", current.name(), name))
        })?;
        let pool = host.get_pool(source.pool())?;

        template = if source.source().is_some() {
            current.template()
        } else {
            None
        };
        resolved = Some(ResolvedSource {
            size: source.size(),
            source,
            pool,
        });
    }

    Ok(resolved)
}

/// Storage of one VM: its volumes and their lifecycle.
pub struct Storage {
    vm: Weak<dyn Domain>,
    vm_name: String,
    host: Arc<Host>,
    volumes: RwLock<BTreeMap<String, Arc<dyn Volume>>>,
    drive: RwLock<Option<String>>,
    attach_lock: Mutex<()>,
}

impl Storage {
    /// Storage of `vm`, built from its volume config on first use.
    pub fn for_domain(vm: &Arc<dyn Domain>, host: &Arc<Host>) -> Result<Arc<Storage>> {
        vm.storage_cell()
            .get_or_try_init(|| Storage::new(vm, host).map(Arc::new))
            .cloned()
    }

    fn new(vm: &Arc<dyn Domain>, host: &Arc<Host>) -> Result<Storage> {
        let storage = Storage {
            vm: Arc::downgrade(vm),
            vm_name: vm.name().to_string(),
            host: host.clone(),
            volumes: RwLock::new(BTreeMap::new()),
            drive: RwLock::new(None),
            attach_lock: Mutex::new(()),
        };

        for (name, config) in vm.volume_config() {
            let volume = storage.resolve_volume(vm, &name, &config)?;
            storage.volumes.write().insert(name, volume);
        }

        debug!(vm = %storage.vm_name, volumes = storage.volumes.read().len(), "Initialized storage");
        Ok(storage)
    }

    fn domain(&self) -> Result<Arc<dyn Domain>> {
        self.vm
            .upgrade()
            .ok_or_else(|| StorageError::DomainGone(self.vm_name.clone()))
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Extra disk given to HVM guests, e.g. an installation ISO.
    pub fn drive(&self) -> Option<String> {
        self.drive.read().clone()
    }

    pub fn set_drive(&self, drive: Option<String>) {
        *self.drive.write() = drive;
    }

    pub fn volumes(&self) -> BTreeMap<String, Arc<dyn Volume>> {
        self.volumes.read().clone()
    }

    pub fn volume(&self, name: &str) -> Option<Arc<dyn Volume>> {
        self.volumes.read().get(name).cloned()
    }

    fn volume_list(&self) -> Vec<Arc<dyn Volume>> {
        self.volumes.read().values().cloned().collect()
    }

    fn lookup(&self, volume: VolumeRef<'_>) -> Result<Arc<dyn Volume>> {
        match volume {
            VolumeRef::Volume(volume) => Ok(volume.clone()),
            VolumeRef::Name(name) => self.volume(name).ok_or_else(|| {
                StorageError::VolumeNotFound(format!("{}:{}", self.vm_name, name))
            }),
        }
    }

    /// Builds (without creating on disk) and registers volume `name`.
    pub fn init_volume(&self, name: &str, config: &VolumeConfig) -> Result<Arc<dyn Volume>> {
        let vm = self.domain()?;
        let volume = self.resolve_volume(&vm, name, config)?;
        self.volumes
            .write()
            .insert(name.to_string(), volume.clone());
        Ok(volume)
    }

    fn resolve_volume(
        &self,
        vm: &Arc<dyn Domain>,
        name: &str,
        config: &VolumeConfig,
    ) -> Result<Arc<dyn Volume>> {
        let mut pool_name = config.pool.clone();
        let mut size = None;

        let source = match (&config.source, config.snap_on_start) {
            (Some(vid), _) => {
                let pool = pool_name.as_deref().ok_or_else(|| StorageError::InvalidConfig {
                    volume: name.to_string(),
                    message: format!("source {vid} given without a pool"),
                })?;
                Some(self.host.get_pool(pool)?.volumes().get(vid)?)
            }
            (None, true) => match resolve_source(vm, name, &self.host)? {
                Some(resolved) => {
                    pool_name = Some(resolved.pool.name().to_string());
                    size = Some(resolved.size);
                    Some(resolved.source)
                }
                None => None,
            },
            (None, false) => None,
        };

        let pool_name =
            pool_name.unwrap_or_else(|| self.host.default_pool_for(name).to_string());
        let pool = self.host.get_pool(&pool_name)?;

        let spec = config.to_spec(name, &pool_name, size, source);
        pool.init_volume(vm.as_ref(), spec)
    }

    /// Frontend names currently in use by the VM.
    pub async fn used_frontends(&self) -> Result<BTreeSet<String>> {
        let descriptors = self
            .host
            .hypervisor()
            .current_descriptors(&self.vm_name)
            .await?;
        Ok(descriptors.into_iter().map(|disk| disk.target).collect())
    }

    pub async fn unused_frontend(&self) -> Result<String> {
        first_unused_frontend(&self.used_frontends().await?)
    }

    /// Attaches `volume` to the running VM, doing nothing if it already is.
    pub async fn attach(&self, volume: &Arc<dyn Volume>, rw: bool) -> Result<()> {
        let hypervisor = self.host.hypervisor();
        if !hypervisor.is_running(&self.vm_name).await {
            return Err(StorageError::DomainNotRunning(self.vm_name.clone()));
        }

        let _guard = self.attach_lock.lock().await;
        let descriptors = hypervisor.current_descriptors(&self.vm_name).await?;

        let source = DiskDescriptor::source_for(volume.vid());
        if descriptors.iter().any(|disk| disk.source == source) {
            info!(vm = %self.vm_name, "{volume:?} already attached");
            return Ok(());
        }

        let used = descriptors.into_iter().map(|disk| disk.target).collect();
        let frontend = first_unused_frontend(&used)?;

        let disk = DiskDescriptor::block(volume.vid(), frontend, rw)
            .with_backend_domain(volume.backend_domain());
        debug!(vm = %self.vm_name, target = %disk.target, "Attaching {volume:?}");
        hypervisor.attach(&self.vm_name, &disk).await
    }

    pub async fn detach(&self, volume: &Arc<dyn Volume>) -> Result<()> {
        let hypervisor = self.host.hypervisor();

        let _guard = self.attach_lock.lock().await;
        let descriptors = hypervisor.current_descriptors(&self.vm_name).await?;

        let source = DiskDescriptor::source_for(volume.vid());
        match descriptors.into_iter().find(|disk| disk.source == source) {
            Some(disk) => hypervisor.detach(&self.vm_name, &disk).await,
            None => Err(StorageError::NotAttached(format!("{volume:?}"))),
        }
    }

    /// Directory holding the VM's kernel, `None` if it boots its own.
    pub fn kernels_dir(&self) -> Result<Option<PathBuf>> {
        let Some(kernel) = self.domain()?.kernel().filter(|kernel| !kernel.is_empty()) else {
            return Ok(None);
        };

        if let Some(dir) = self
            .volume("kernel")
            .and_then(|volume| volume.kernels_dir())
        {
            return Ok(Some(dir));
        }
        Ok(Some(self.host.kernels_dir().join(kernel)))
    }

    /// Summed usage of all volumes, in bytes.
    pub fn get_disk_utilization(&self) -> u64 {
        self.volumes.read().values().map(|volume| volume.usage()).sum()
    }

    /// Resizes a volume, then asks the running guest to grow its filesystem.
    pub async fn resize<'a>(&self, volume: impl Into<VolumeRef<'a>>, size: u64) -> Result<()> {
        let volume = self.lookup(volume.into())?;
        volume.resize(size).await?;

        if self.host.hypervisor().is_running(&self.vm_name).await {
            let result = self
                .host
                .guest()
                .run_service(&self.vm_name, RESIZE_SERVICE, volume.name().as_bytes(), "root")
                .await;

            if let Err(failure) = result {
                let service_error: String = failure
                    .stderr
                    .iter()
                    .filter(|b| b.is_ascii() && **b != b'%')
                    .map(|b| char::from(*b))
                    .collect();
                return Err(StorageError::Capacity {
                    volume: format!("{volume:?}"),
                    message: format!(
                        "Online resize of volume {volume} failed (you need to resize filesystem manually): {service_error}"
                    ),
                });
            }
        }

        Ok(())
    }

    /// Creates every volume on disk.
    pub async fn create(&self) -> Result<()> {
        info!(vm = %self.vm_name, "Creating volumes");
        fan_out(self.volume_list(), |volume| async move { volume.create().await }).await?;
        Ok(())
    }

    /// Creates volume `name` from this VM's own config and fills it with the
    /// data of `src_vm`'s same-named volume.
    pub async fn clone_volume(
        &self,
        src_vm: &Arc<dyn Domain>,
        name: &str,
    ) -> Result<Arc<dyn Volume>> {
        let created = SyncMutex::new(Vec::new());
        let volume = self.clone_one(src_vm, name, &created).await?;
        self.volumes
            .write()
            .insert(name.to_string(), volume.clone());
        Ok(volume)
    }

    async fn clone_one(
        &self,
        src_vm: &Arc<dyn Domain>,
        name: &str,
        created: &SyncMutex<Vec<Arc<dyn Volume>>>,
    ) -> Result<Arc<dyn Volume>> {
        let vm = self.domain()?;
        let config = vm.volume_config().remove(name).ok_or_else(|| {
            StorageError::VolumeNotFound(format!("{}:{}", self.vm_name, name))
        })?;

        let src_volume = Storage::for_domain(src_vm, &self.host)?
            .volume(name)
            .ok_or_else(|| StorageError::VolumeNotFound(format!("{}:{}", src_vm.name(), name)))?;
        let dst = self.resolve_volume(&vm, name, &config)?;

        info!(
            vm = %self.vm_name,
            "Importing volume {} from vm {}",
            src_volume.name(),
            src_vm.name()
        );
        dst.create().await?;
        created.lock().push(dst.clone());
        dst.import_volume(&src_volume).await?;
        Ok(dst)
    }

    /// Replaces all volumes with clones of `src_vm`'s.
    ///
    /// On any failure every volume created so far is removed, together with
    /// the VM directory, and the original error is returned.
    pub async fn clone_from_vm(&self, src_vm: &Arc<dyn Domain>) -> Result<()> {
        let vm = self.domain()?;
        self.volumes.write().clear();

        let names: Vec<String> = vm.volume_config().into_keys().collect();
        let created = SyncMutex::new(Vec::new());
        let created_ref = &created;

        let result = fan_out(names, |name| async move {
            let volume = self.clone_one(src_vm, &name, created_ref).await?;
            Ok((name, volume))
        })
        .await;

        match result {
            Ok(cloned) => {
                self.volumes.write().extend(cloned);
                Ok(())
            }
            Err(e) => {
                self.rollback(&vm.dir_path(), created.into_inner()).await;
                Err(e)
            }
        }
    }

    async fn rollback(&self, dir_path: &Path, created: Vec<Arc<dyn Volume>>) {
        warn!(vm = %self.vm_name, volumes = created.len(), "Volume creation failed, cleaning up");

        for volume in created.into_iter().rev() {
            if let Err(e) = volume.remove().await {
                debug!(vm = %self.vm_name, "Ignoring failure to remove {volume:?}: {e}");
            }
        }

        match fs::remove_dir_all(dir_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(vm = %self.vm_name, "Ignoring failure to remove {}: {e}", dir_path.display()),
        }
    }

    /// Whether the VM is still around and not halted.
    async fn is_running(&self) -> bool {
        self.host.hypervisor().is_running(&self.vm_name).await
    }

    /// Snapshot volumes whose source changed since the VM started.
    pub async fn outdated_volumes(&self) -> Result<Vec<Arc<dyn Volume>>> {
        if !self.is_running().await {
            return Ok(vec![]);
        }

        let mut result = Vec::new();
        for volume in self.volume_list() {
            match volume.is_outdated().await {
                Ok(true) => result.push(volume),
                Ok(false) => {}
                Err(e) if e.is_not_implemented() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Checks the VM directory and every volume, then notifies the VM.
    pub async fn verify(&self) -> Result<()> {
        let vm = self.domain()?;
        let dir_path = vm.dir_path();
        if !fs::try_exists(&dir_path).await.unwrap_or(false) {
            return Err(StorageError::DomainDirMissing {
                vm: self.vm_name.clone(),
                path: dir_path,
            });
        }

        fan_out(self.volume_list(), |volume| async move { volume.verify().await }).await?;
        vm.fire_event(DomainEvent::VerifyFiles);
        Ok(())
    }

    /// Removes every volume. Failures are logged, never returned.
    pub async fn remove(&self) {
        let volumes = self.volume_list();
        for volume in &volumes {
            info!(vm = %self.vm_name, "Removing volume {}: {}", volume.name(), volume.vid());
        }

        let errors = fan_out_best_effort(volumes, |volume| async move {
            let result = volume.remove().await;
            if let Err(e) = &result {
                error!(vm = %self.vm_name, "Failed to remove volume {}: {e}", volume.name());
            }
            result
        })
        .await;

        if !errors.is_empty() {
            error!(vm = %self.vm_name, failed = errors.len(), "Failed to remove some volumes");
        }
    }

    pub async fn start(&self) -> Result<()> {
        fan_out(self.volume_list(), |volume| async move { volume.start().await }).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        fan_out(self.volume_list(), |volume| async move { volume.stop().await }).await?;
        Ok(())
    }

    pub async fn export<'a>(&self, volume: impl Into<VolumeRef<'a>>) -> Result<PathBuf> {
        self.lookup(volume.into())?.export().await
    }

    pub async fn export_end<'a>(
        &self,
        volume: impl Into<VolumeRef<'a>>,
        export_path: &Path,
    ) -> Result<()> {
        self.lookup(volume.into())?.export_end(export_path).await;
        Ok(())
    }

    /// `size` defaults to the current volume size.
    pub async fn import_data<'a>(
        &self,
        volume: impl Into<VolumeRef<'a>>,
        size: Option<u64>,
    ) -> Result<PathBuf> {
        let volume = self.lookup(volume.into())?;
        let size = size.unwrap_or_else(|| volume.size());
        volume.import_data(size).await
    }

    pub async fn import_data_end<'a>(
        &self,
        volume: impl Into<VolumeRef<'a>>,
        success: bool,
    ) -> Result<()> {
        self.lookup(volume.into())?.import_data_end(success).await
    }
}
