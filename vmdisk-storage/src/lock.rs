//! Per-volume operation lock.
//!
//! Backends hand out volumes wrapped in [`Locked`], so that mutating calls on
//! one volume instance run one at a time while calls on different instances
//! proceed concurrently.

use crate::volume::{Volume, VolumeInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use vmdisk_core::{BlockDevice, ConfigMap, Result};

pub struct Locked<V> {
    inner: V,
    lock: Mutex<()>,
}

impl<V: Volume + 'static> Locked<V> {
    pub fn new(inner: V) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }

    pub fn wrap(inner: V) -> Arc<dyn Volume> {
        Arc::new(Self::new(inner))
    }
}

#[async_trait]
impl<V: Volume> Volume for Locked<V> {
    fn info(&self) -> &VolumeInfo {
        self.inner.info()
    }

    async fn create(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.create().await
    }

    async fn remove(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.remove().await
    }

    async fn export(&self) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        self.inner.export().await
    }

    async fn export_end(&self, path: &Path) {
        let _guard = self.lock.lock().await;
        self.inner.export_end(path).await
    }

    async fn import_data(&self, size: u64) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        self.inner.import_data(size).await
    }

    async fn import_data_end(&self, success: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.import_data_end(success).await
    }

    async fn import_volume(&self, src: &Arc<dyn Volume>) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.import_volume(src).await
    }

    async fn is_dirty(&self) -> Result<bool> {
        self.inner.is_dirty().await
    }

    async fn is_outdated(&self) -> Result<bool> {
        self.inner.is_outdated().await
    }

    async fn resize(&self, size: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.resize(size).await
    }

    async fn revert(&self, revision: Option<&str>) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.revert(revision).await
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.start().await
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.stop().await
    }

    async fn verify(&self) -> Result<()> {
        self.inner.verify().await
    }

    async fn revisions(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        self.inner.revisions().await
    }

    fn usage(&self) -> u64 {
        self.inner.usage()
    }

    fn path(&self) -> Option<PathBuf> {
        self.inner.path()
    }

    fn script(&self) -> Option<String> {
        self.inner.script()
    }

    fn backend_domain(&self) -> Option<String> {
        self.inner.backend_domain()
    }

    fn devtype(&self) -> &str {
        self.inner.devtype()
    }

    fn kernels_dir(&self) -> Option<PathBuf> {
        self.inner.kernels_dir()
    }

    fn block_device(&self) -> Option<BlockDevice> {
        self.inner.block_device()
    }

    fn config(&self) -> ConfigMap {
        self.inner.config()
    }
}
