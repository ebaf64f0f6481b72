//! Finding which pool physically holds a directory.

use crate::pool::Pool;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub type ThinPoolResolver = fn(&Path) -> Option<(String, String)>;

/// Memoized lookup of the device-mapper thin pool backing a directory.
///
/// Negative answers are remembered as well, so each directory is probed at
/// most once per process.
pub struct DirectoryThinPool {
    cache: Mutex<HashMap<PathBuf, Option<(String, String)>>>,
    resolver: ThinPoolResolver,
}

impl DirectoryThinPool {
    pub fn new(resolver: ThinPoolResolver) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            resolver,
        }
    }

    /// `(volume_group, thin_pool)` containing the filesystem of `dir_path`.
    pub fn thin_pool(&self, dir_path: &Path) -> Option<(String, String)> {
        if let Some(cached) = self.cache.lock().get(dir_path) {
            return cached.clone();
        }

        let found = (self.resolver)(dir_path);
        debug!(dir = %dir_path.display(), found = ?found, "Resolved thin pool");
        self.cache
            .lock()
            .insert(dir_path.to_path_buf(), found.clone());
        found
    }
}

static DIRECTORY_THIN_POOL: Lazy<DirectoryThinPool> =
    Lazy::new(|| DirectoryThinPool::new(dmsetup_thin_pool));

pub fn directory_thin_pool() -> &'static DirectoryThinPool {
    &DIRECTORY_THIN_POOL
}

/// Resolves symlinks in `path` even when its tail does not exist yet: the
/// longest existing ancestor is canonicalized and the rest appended.
pub(crate) fn real_path(path: &Path) -> PathBuf {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    for ancestor in path.ancestors() {
        if let Ok(resolved) = std::fs::canonicalize(ancestor) {
            return match path.strip_prefix(ancestor) {
                Ok(rest) => resolved.join(rest),
                Err(_) => resolved,
            };
        }
    }
    path
}

/// Pool among `pools` containing `dir_path`, used to implement
/// [`Pool::included_in`].
///
/// Filesystem pools whose directory is a prefix of `dir_path` win; otherwise
/// a thin pool backing the filesystem of `dir_path` is looked for.
pub fn search_pool_containing_dir(pools: &[Arc<dyn Pool>], dir_path: &Path) -> Option<Arc<dyn Pool>> {
    search_with(pools, dir_path, directory_thin_pool())
}

pub fn search_with(
    pools: &[Arc<dyn Pool>],
    dir_path: &Path,
    thin_pools: &DirectoryThinPool,
) -> Option<Arc<dyn Pool>> {
    let real_dir_path = real_path(dir_path);

    let by_dir = pools.iter().find(|pool| {
        pool.dir_path()
            .is_some_and(|pool_dir| real_dir_path.starts_with(real_path(pool_dir)))
    });
    if let Some(pool) = by_dir {
        return Some(pool.clone());
    }

    let thin_pools_present = pools.iter().any(|pool| pool.thin_pool().is_some());
    if !thin_pools_present {
        return None;
    }

    let (volume_group, thin_pool) = thin_pools.thin_pool(&real_dir_path)?;
    pools
        .iter()
        .find(|pool| pool.thin_pool() == Some((volume_group.as_str(), thin_pool.as_str())))
        .cloned()
}

/// Device number of the thin pool from a `dmsetup table` line, if the
/// device is a thin volume.
pub fn parse_thin_target(table: &str) -> Option<String> {
    let mut fields = table.trim_end().splitn(4, ' ');
    let _start = fields.next()?;
    let _sectors = fields.next()?;
    let target_type = fields.next()?;
    let target_args = fields.next()?;

    if target_type != "thin" {
        return None;
    }
    let (pool_devnum, _thin_id) = target_args.split_once(' ')?;
    Some(pool_devnum.to_string())
}

/// Splits an LVM `<vg>-<pool>-tpool` device name. Hyphens inside either
/// part are doubled by LVM.
pub fn split_tpool_name(name: &str) -> Option<(String, String)> {
    let name = name.trim_end_matches('\n').strip_suffix("-tpool")?;
    let escaped = name.replace("--", "=");
    let (volume_group, thin_pool) = escaped.rsplit_once('-')?;
    Some((volume_group.replace('=', "-"), thin_pool.replace('=', "-")))
}

#[cfg(target_os = "linux")]
fn dmsetup_thin_pool(dir_path: &Path) -> Option<(String, String)> {
    use std::os::unix::fs::MetadataExt;
    use std::process::{Command, Stdio};

    let dev = std::fs::metadata(dir_path).ok()?.dev();
    let major = (dev & 0xff00) >> 8;
    let minor = dev & 0xff;

    let mut command = if nix::unistd::Uid::effective().is_root() {
        Command::new("dmsetup")
    } else {
        let mut sudo = Command::new("sudo");
        sudo.arg("dmsetup");
        sudo
    };
    let output = command
        .args(["-j", &major.to_string(), "-m", &minor.to_string(), "table"])
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let pool_devnum = parse_thin_target(&String::from_utf8_lossy(&output.stdout))?;
    let tpool = std::fs::read_to_string(format!("/sys/dev/block/{pool_devnum}/dm/name")).ok()?;
    split_tpool_name(&tpool)
}

#[cfg(not(target_os = "linux"))]
fn dmsetup_thin_pool(_dir_path: &Path) -> Option<(String, String)> {
    None
}
