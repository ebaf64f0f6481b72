//! Pool driver keeping volumes as sparse image files in a directory.
//!
//! Layout under the pool directory, for a volume with id `vid`:
//!
//! - `<vid>.img`: committed data
//! - `<vid>-cow.img`: what the running VM sees, present only while started
//! - `<vid>-import.img`: data being imported
//! - `<vid>.img.<micros>.old`: revisions, newest kept

use crate::domain::Domain;
use crate::host::Host;
use crate::locator::search_pool_containing_dir;
use crate::lock::Locked;
use crate::pool::Pool;
use crate::volume::{Volume, VolumeInfo, VolumeMode, VolumeSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};
use vmdisk_core::{ConfigMap, ConfigValue, PoolDefinition, Result, StorageError};

const IMAGE_SUFFIX: &str = ".img";
const COW_SUFFIX: &str = "-cow.img";
const IMPORT_SUFFIX: &str = "-import.img";
const REVISION_SUFFIX: &str = ".old";

pub struct FilePool {
    name: String,
    dir_path: PathBuf,
    revisions_to_keep: u32,
}

impl FilePool {
    pub const DRIVER: &'static str = "file";
    pub const PARAMETERS: &'static [&'static str] = &["dir_path", "revisions_to_keep"];

    pub fn new(name: impl Into<String>, dir_path: impl Into<PathBuf>, revisions_to_keep: u32) -> Self {
        Self {
            name: name.into(),
            dir_path: dir_path.into(),
            revisions_to_keep,
        }
    }

    pub fn from_definition(definition: &PoolDefinition) -> Result<Arc<dyn Pool>> {
        let dir_path = definition.options.get("dir_path").ok_or_else(|| {
            StorageError::ConfigError(format!("Pool {} requires dir_path", definition.name))
        })?;
        let revisions_to_keep = match definition.options.get("revisions_to_keep") {
            Some(value) => value.parse().map_err(|_| {
                StorageError::ConfigError(format!(
                    "Pool {}: invalid revisions_to_keep {value:?}",
                    definition.name
                ))
            })?,
            None => 1,
        };

        Ok(Arc::new(Self::new(
            definition.name.clone(),
            dir_path,
            revisions_to_keep,
        )))
    }

    fn volume(&self, spec: &VolumeSpec, vid: String) -> Result<Arc<dyn Volume>> {
        let revisions_to_keep = spec.revisions_to_keep.unwrap_or(self.revisions_to_keep);
        let info = VolumeInfo::new(spec, vid, revisions_to_keep)?;
        Ok(Locked::wrap(FileVolume::new(info, &self.dir_path)))
    }

    /// A volume found on disk. Its declared mode is not recorded there, so
    /// it is presented as an origin volume.
    fn discovered(&self, vid: &str, size: u64) -> Result<Arc<dyn Volume>> {
        let name = vid.rsplit('/').next().unwrap_or(vid);
        let spec = VolumeSpec {
            rw: true,
            save_on_stop: true,
            size,
            ..VolumeSpec::new(name, self.name.as_str())
        };
        self.volume(&spec, vid.to_string())
    }

    fn scan(&self, dir: &Path, prefix: &str, found: &mut Vec<(String, u64)>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata()?;

            if metadata.is_dir() {
                self.scan(&entry.path(), &format!("{prefix}{file_name}/"), found)?;
                continue;
            }

            let Some(stem) = file_name.strip_suffix(IMAGE_SUFFIX) else {
                continue;
            };
            if stem.ends_with("-cow") || stem.ends_with("-import") {
                continue;
            }
            found.push((format!("{prefix}{stem}"), metadata.len()));
        }
        Ok(())
    }
}

#[async_trait]
impl Pool for FilePool {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &str {
        Self::DRIVER
    }

    fn revisions_to_keep(&self) -> u32 {
        self.revisions_to_keep
    }

    fn config(&self) -> ConfigMap {
        let mut config = ConfigMap::new();
        config.insert("name".to_string(), self.name.as_str().into());
        config.insert("driver".to_string(), Self::DRIVER.into());
        config.insert(
            "dir_path".to_string(),
            ConfigValue::Str(self.dir_path.to_string_lossy().into_owned()),
        );
        config.insert(
            "revisions_to_keep".to_string(),
            self.revisions_to_keep.into(),
        );
        config
    }

    fn init_volume(&self, vm: &dyn Domain, spec: VolumeSpec) -> Result<Arc<dyn Volume>> {
        let vid = spec
            .vid
            .clone()
            .unwrap_or_else(|| format!("{}/{}", vm.name(), spec.name));
        self.volume(&spec, vid)
    }

    async fn setup(&self) -> Result<()> {
        fs::create_dir_all(&self.dir_path).await?;
        Ok(())
    }

    /// Removes the pool directory, which must already be empty.
    async fn destroy(&self) -> Result<()> {
        match fs::remove_dir(&self.dir_path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn list_volumes(&self) -> Result<Vec<Arc<dyn Volume>>> {
        let mut found = Vec::new();
        self.scan(&self.dir_path, "", &mut found)?;
        found.sort();
        found
            .into_iter()
            .map(|(vid, size)| self.discovered(&vid, size))
            .collect()
    }

    fn get_volume(&self, vid: &str) -> Result<Arc<dyn Volume>> {
        let image = self.dir_path.join(format!("{vid}{IMAGE_SUFFIX}"));
        match std::fs::metadata(&image) {
            Ok(metadata) if metadata.is_file() => self.discovered(vid, metadata.len()),
            Ok(_) => Err(StorageError::VolumeNotFound(format!("{}:{vid}", self.name))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::VolumeNotFound(format!("{}:{vid}", self.name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn included_in(&self, host: &Host) -> Option<Arc<dyn Pool>> {
        let others: Vec<_> = host
            .pools()
            .into_iter()
            .filter(|pool| pool.name() != self.name)
            .collect();
        search_pool_containing_dir(&others, &self.dir_path)
    }

    async fn usage(&self) -> Option<u64> {
        let mut found = Vec::new();
        self.scan(&self.dir_path, "", &mut found).ok()?;
        Some(
            found
                .iter()
                .map(|(vid, _)| allocated(&self.dir_path.join(format!("{vid}{IMAGE_SUFFIX}"))))
                .sum(),
        )
    }

    fn dir_path(&self) -> Option<&Path> {
        Some(&self.dir_path)
    }
}

/// Bytes actually allocated for `path`, 0 if it does not exist.
#[cfg(unix)]
fn allocated(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).map(|m| m.blocks() * 512).unwrap_or(0)
}

#[cfg(not(unix))]
fn allocated(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn create_sparse(path: &Path, size: u64) -> Result<()> {
    ensure_parent(path).await?;
    let file = fs::File::create(path).await?;
    file.set_len(size).await?;
    Ok(())
}

pub struct FileVolume {
    info: VolumeInfo,
    image_path: PathBuf,
    cow_path: PathBuf,
    import_path: PathBuf,
}

impl FileVolume {
    pub fn new(info: VolumeInfo, pool_dir: &Path) -> Self {
        let vid = info.vid();
        Self {
            image_path: pool_dir.join(format!("{vid}{IMAGE_SUFFIX}")),
            cow_path: pool_dir.join(format!("{vid}{COW_SUFFIX}")),
            import_path: pool_dir.join(format!("{vid}{IMPORT_SUFFIX}")),
            info,
        }
    }

    fn revision_path(&self, revision: &str) -> PathBuf {
        let mut name = self.image_path.as_os_str().to_owned();
        name.push(format!(".{revision}{REVISION_SUFFIX}"));
        PathBuf::from(name)
    }

    fn source(&self) -> Result<&Arc<dyn Volume>> {
        self.info.source().ok_or_else(|| StorageError::InvalidConfig {
            volume: self.info.id(),
            message: "snapshot volume has no source".to_string(),
        })
    }

    /// Revisions on disk as `(micros, id)`, oldest first.
    async fn revision_entries(&self) -> Result<Vec<(i64, String)>> {
        let (Some(dir), Some(image_name)) = (self.image_path.parent(), self.image_path.file_name())
        else {
            return Ok(vec![]);
        };
        let prefix = format!("{}.", image_name.to_string_lossy());

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut revisions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let revision = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(REVISION_SUFFIX));
            if let Some(revision) = revision {
                if let Ok(micros) = revision.parse::<i64>() {
                    revisions.push((micros, revision.to_string()));
                }
            }
        }
        revisions.sort();
        Ok(revisions)
    }

    /// Moves the committed image aside as a new revision and prunes old ones.
    async fn rotate_image(&self) -> Result<()> {
        if !exists(&self.image_path).await {
            return Ok(());
        }

        if self.info.revisions_to_keep() == 0 {
            return remove_if_exists(&self.image_path).await;
        }

        let revision = Utc::now().timestamp_micros().to_string();
        fs::rename(&self.image_path, self.revision_path(&revision)).await?;

        let revisions = self.revision_entries().await?;
        let keep = self.info.revisions_to_keep() as usize;
        let excess = revisions.len().saturating_sub(keep);
        for (_, revision) in revisions.into_iter().take(excess) {
            debug!(volume = %self.info.id(), revision = %revision, "Pruning revision");
            remove_if_exists(&self.revision_path(&revision)).await?;
        }
        Ok(())
    }

    /// Copies the source's exported data into the cow file.
    async fn snapshot_source(&self) -> Result<()> {
        let source = self.source()?;
        let export = source.export().await?;
        ensure_parent(&self.cow_path).await?;
        let copied = fs::copy(&export, &self.cow_path).await;
        source.export_end(&export).await;
        copied?;

        let file = fs::OpenOptions::new().write(true).open(&self.cow_path).await?;
        if file.metadata().await?.len() < self.info.size() {
            file.set_len(self.info.size()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Volume for FileVolume {
    fn info(&self) -> &VolumeInfo {
        &self.info
    }

    async fn create(&self) -> Result<()> {
        if self.info.save_on_stop() {
            create_sparse(&self.image_path, self.info.size()).await?;
        }
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        for path in [&self.image_path, &self.cow_path, &self.import_path] {
            remove_if_exists(path).await?;
        }
        for (_, revision) in self.revision_entries().await? {
            remove_if_exists(&self.revision_path(&revision)).await?;
        }
        Ok(())
    }

    async fn export(&self) -> Result<PathBuf> {
        match self.info.mode() {
            VolumeMode::Origin | VolumeMode::OriginSnapshot => Ok(self.image_path.clone()),
            VolumeMode::Snapshot => self.source()?.export().await,
            VolumeMode::Volatile => Err(StorageError::Pool(format!(
                "Cannot export volatile volume {}",
                self.info.id()
            ))),
        }
    }

    async fn export_end(&self, path: &Path) {
        if self.info.mode() == VolumeMode::Snapshot {
            if let Some(source) = self.info.source() {
                source.export_end(path).await;
            }
        }
    }

    async fn import_data(&self, size: u64) -> Result<PathBuf> {
        create_sparse(&self.import_path, size).await?;
        Ok(self.import_path.clone())
    }

    async fn import_data_end(&self, success: bool) -> Result<()> {
        if !success {
            return remove_if_exists(&self.import_path).await;
        }

        let size = fs::metadata(&self.import_path).await?.len();
        self.rotate_image().await?;
        fs::rename(&self.import_path, &self.image_path).await?;
        self.info.set_size(size);
        Ok(())
    }

    async fn import_volume(&self, src: &Arc<dyn Volume>) -> Result<()> {
        if !self.info.save_on_stop() {
            return Ok(());
        }

        let export = src.export().await?;
        ensure_parent(&self.image_path).await?;
        let copied = fs::copy(&export, &self.image_path).await;
        src.export_end(&export).await;
        let size = copied?;

        self.info.set_size(size.max(self.info.size()));
        Ok(())
    }

    async fn is_dirty(&self) -> Result<bool> {
        Ok(self.info.save_on_stop() && exists(&self.cow_path).await)
    }

    async fn is_outdated(&self) -> Result<bool> {
        if !self.info.snap_on_start() {
            return Ok(false);
        }

        let source = self.source()?;
        let export = source.export().await?;
        let source_modified = fs::metadata(&export).await.and_then(|m| m.modified());
        source.export_end(&export).await;

        let snapshot_modified = match fs::metadata(&self.cow_path).await {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(source_modified? > snapshot_modified)
    }

    async fn resize(&self, size: u64) -> Result<()> {
        if size < self.info.size() {
            return Err(StorageError::Capacity {
                volume: self.info.id(),
                message: format!(
                    "For your own safety, shrinking of {} is disabled ({} < {}). If you really know what you are doing, resize filesystem manually first.",
                    self.info.name(),
                    size,
                    self.info.size()
                ),
            });
        }

        for path in [&self.image_path, &self.cow_path] {
            if exists(path).await {
                let file = fs::OpenOptions::new().write(true).open(path).await?;
                file.set_len(size).await?;
            }
        }
        self.info.set_size(size);
        Ok(())
    }

    async fn revert(&self, revision: Option<&str>) -> Result<()> {
        let revisions = self.revision_entries().await?;
        let revision = match revision {
            Some(wanted) => revisions
                .into_iter()
                .find(|(_, id)| id == wanted)
                .map(|(_, id)| id)
                .ok_or_else(|| {
                    StorageError::Pool(format!("{}: no revision {wanted}", self.info.id()))
                })?,
            None => revisions
                .into_iter()
                .next_back()
                .map(|(_, id)| id)
                .ok_or_else(|| StorageError::Pool(format!("{}: no revisions", self.info.id())))?,
        };

        info!(volume = %self.info.id(), revision = %revision, "Reverting volume");
        fs::rename(self.revision_path(&revision), &self.image_path).await?;
        self.info.set_size(fs::metadata(&self.image_path).await?.len());
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        match self.info.mode() {
            VolumeMode::Volatile => create_sparse(&self.cow_path, self.info.size()).await,
            VolumeMode::Snapshot | VolumeMode::OriginSnapshot => self.snapshot_source().await,
            VolumeMode::Origin => {
                ensure_parent(&self.cow_path).await?;
                fs::copy(&self.image_path, &self.cow_path).await?;
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if self.info.save_on_stop() {
            if exists(&self.cow_path).await {
                self.rotate_image().await?;
                fs::rename(&self.cow_path, &self.image_path).await?;
            }
            Ok(())
        } else {
            remove_if_exists(&self.cow_path).await
        }
    }

    async fn verify(&self) -> Result<()> {
        match self.info.mode() {
            VolumeMode::Origin | VolumeMode::OriginSnapshot => {
                if exists(&self.image_path).await {
                    Ok(())
                } else {
                    Err(StorageError::VolumeNotFound(format!(
                        "{}: missing image {}",
                        self.info.id(),
                        self.image_path.display()
                    )))
                }
            }
            VolumeMode::Snapshot => self.source()?.verify().await,
            VolumeMode::Volatile => Ok(()),
        }
    }

    async fn revisions(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        Ok(self
            .revision_entries()
            .await?
            .into_iter()
            .filter_map(|(micros, id)| DateTime::from_timestamp_micros(micros).map(|at| (id, at)))
            .collect())
    }

    fn usage(&self) -> u64 {
        let path = if self.cow_path.exists() {
            &self.cow_path
        } else {
            &self.image_path
        };
        allocated(path).min(self.info.size())
    }

    fn path(&self) -> Option<PathBuf> {
        Some(self.cow_path.clone())
    }
}
