//! Eviction Capacity Policies
//!
//! Each policy answers one question: given the cache's current size, how
//! many bytes should be freed? Multiple policies may be active; the manager
//! takes the maximum across them.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Capacity check deciding how many bytes eviction should free.
pub trait Policy: Send + Sync {
    /// Bytes to free given the current cache size. Zero means no eviction.
    fn bytes_to_free(&self, current_size: u64) -> Result<u64>;
}

/// Triggers eviction when the cache exceeds a fixed size.
pub struct MaxSizePolicy {
    pub max_bytes: u64,
}

impl Policy for MaxSizePolicy {
    fn bytes_to_free(&self, current_size: u64) -> Result<u64> {
        Ok(current_size.saturating_sub(self.max_bytes))
    }
}

/// Triggers eviction when free space on the cache filesystem drops below a
/// threshold.
pub struct MinFreeSpacePolicy {
    pub path: PathBuf,
    pub min_free_bytes: u64,
}

impl Policy for MinFreeSpacePolicy {
    fn bytes_to_free(&self, _current_size: u64) -> Result<u64> {
        let free = available_bytes(&self.path)
            .map_err(|e| Error::CapacityCheckFailed(format!("statvfs {:?}: {e}", self.path)))?;
        Ok(self.min_free_bytes.saturating_sub(free))
    }
}

/// Available bytes (for unprivileged users) on the filesystem containing
/// `path`.
#[cfg(target_family = "unix")]
pub fn available_bytes(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: statvfs is a plain C struct of integers, zero is a valid
    // initial state.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: path_cstr is a valid NUL-terminated string and stat is a valid
    // out-pointer for the POSIX statvfs call.
    let rc = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(target_family = "unix"))]
pub fn available_bytes(_path: &Path) -> std::io::Result<u64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "free-space checks require a unix filesystem",
    ))
}

// =============================================================================
// Tests
// =============================================================================
