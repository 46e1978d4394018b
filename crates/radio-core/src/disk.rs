//! Free-space floor for the recordings volume.

use std::io;
use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, warn};

use crate::error::{RecorderError, Result};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / GIB
}

pub trait DiskGuard: Send + Sync {
    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;

    /// Never cached: callers run this immediately before every launch.
    fn ensure_space(&self, path: &Path, floor_gib: f64) -> Result<()> {
        let free = self.free_bytes(path).map_err(|e| {
            warn!("[disk] cannot read free space for {}: {}", path.display(), e);
            RecorderError::InsufficientDisk {
                path: path.to_path_buf(),
                free_gib: 0.0,
                floor_gib,
            }
        })?;
        let free_gib = bytes_to_gib(free);
        debug!("[disk] {:.2} GiB free on {}", free_gib, path.display());
        if free_gib < floor_gib {
            return Err(RecorderError::InsufficientDisk {
                path: path.to_path_buf(),
                free_gib,
                floor_gib,
            });
        }
        Ok(())
    }

    fn has_space(&self, path: &Path, floor_gib: f64) -> bool {
        self.ensure_space(path, floor_gib).is_ok()
    }
}

/// Reads mount points through sysinfo.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDisks;

/// The recordings root may not exist yet; measure the closest ancestor that does.
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if let Ok(canonical) = std::fs::canonicalize(current) {
            return canonical;
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return path.to_path_buf(),
        }
    }
}

impl DiskGuard for SystemDisks {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        let target = existing_ancestor(path);
        let disks = Disks::new_with_refreshed_list();

        // longest mount point that prefixes the target wins
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted filesystem contains {}", target.display()),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedFree(u64);

    impl DiskGuard for FixedFree {
        fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    struct Broken;

    impl DiskGuard for Broken {
        fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
            Err(io::Error::new(io::ErrorKind::Other, "statvfs failed"))
        }
    }

    #[test]
    fn below_floor_has_no_space() {
        let one_and_a_half = (1.5 * GIB) as u64;
        let guard = FixedFree(one_and_a_half);
        assert!(!guard.has_space(Path::new("/rec"), 2.0));
        match guard.ensure_space(Path::new("/rec"), 2.0) {
            Err(RecorderError::InsufficientDisk { free_gib, floor_gib, .. }) => {
                assert!((free_gib - 1.5).abs() < 1e-9);
                assert_eq!(floor_gib, 2.0);
            }
            other => panic!("expected InsufficientDisk, got {other:?}"),
        }
    }

    #[test]
    fn at_or_above_floor_has_space() {
        assert!(FixedFree(2 * 1024 * 1024 * 1024).has_space(Path::new("/rec"), 2.0));
        assert!(FixedFree(u64::MAX).has_space(Path::new("/rec"), 2.0));
    }

    #[test]
    fn unreadable_disk_is_treated_as_full() {
        assert!(!Broken.has_space(Path::new("/rec"), 0.0));
    }

    #[test]
    fn missing_directory_measures_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("yet");
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(existing_ancestor(&missing), canonical);
    }
}
