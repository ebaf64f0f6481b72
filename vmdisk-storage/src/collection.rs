use crate::pool::Pool;
use crate::volume::Volume;
use std::sync::Arc;
use vmdisk_core::{Result, StorageError};

/// Lookup key: a volume id, or a volume whose `(pool, vid)` should be found again.
#[derive(Clone, Copy)]
pub enum VolumeKey<'a> {
    Vid(&'a str),
    Volume(&'a (dyn Volume + 'static)),
}

impl<'a> From<&'a str> for VolumeKey<'a> {
    fn from(vid: &'a str) -> Self {
        VolumeKey::Vid(vid)
    }
}

impl<'a> From<&'a String> for VolumeKey<'a> {
    fn from(vid: &'a String) -> Self {
        VolumeKey::Vid(vid)
    }
}

impl<'a> From<&'a Arc<dyn Volume>> for VolumeKey<'a> {
    fn from(volume: &'a Arc<dyn Volume>) -> Self {
        VolumeKey::Volume(volume.as_ref())
    }
}

/// Read-only view over the volumes of one pool.
///
/// Nothing is cached: every call reflects the live state of the pool.
pub struct VolumesCollection<'a> {
    pool: &'a dyn Pool,
}

impl<'a> VolumesCollection<'a> {
    pub fn new(pool: &'a dyn Pool) -> Self {
        Self { pool }
    }

    pub fn get<'k>(&self, key: impl Into<VolumeKey<'k>>) -> Result<Arc<dyn Volume>> {
        match key.into() {
            VolumeKey::Volume(volume) => {
                if volume.pool() == self.pool.name() {
                    self.get_by_vid(volume.vid())
                } else {
                    Err(StorageError::VolumeNotFound(format!("{volume:?}")))
                }
            }
            VolumeKey::Vid(vid) => self.get_by_vid(vid),
        }
    }

    fn get_by_vid(&self, vid: &str) -> Result<Arc<dyn Volume>> {
        match self.pool.get_volume(vid) {
            Err(e) if e.is_not_implemented() => {
                // list_volumes() reports its own NotImplemented if it is missing too
                self.list()?
                    .into_iter()
                    .find(|volume| volume.vid() == vid)
                    .ok_or_else(|| StorageError::VolumeNotFound(vid.to_string()))
            }
            other => other,
        }
    }

    /// `Ok(false)` for a missing volume; other failures are passed on.
    pub fn contains<'k>(&self, key: impl Into<VolumeKey<'k>>) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(StorageError::VolumeNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn list(&self) -> Result<Vec<Arc<dyn Volume>>> {
        self.pool.list_volumes()
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .iter()
            .map(|volume| volume.vid().to_string())
            .collect())
    }

    pub fn values(&self) -> Result<Vec<Arc<dyn Volume>>> {
        self.list()
    }
}
