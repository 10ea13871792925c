//! POSIX shared memory backend
//!
//! Names follow the `multiprocessing.shared_memory` convention: the user-facing
//! name has no leading slash, the OS object is `/<name>`.

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::SharedRegion;
use crate::error::{AppError, Result};

/// Memory-mapped POSIX shared memory object
pub struct ShmRegion {
    name: String,
    map: MmapMut,
    ptr: *mut u8,
    /// Regions we created are unlinked on release; attached ones are left alone
    owner: bool,
    released: AtomicBool,
}

// SAFETY: the mapping is owned by `map` and never remapped; concurrent access
// goes through raw byte copies or atomics.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("name", &self.name)
            .field("len", &self.map.len())
            .field("owner", &self.owner)
            .finish()
    }
}

fn os_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

impl ShmRegion {
    /// Create a new zero-filled region of `len` bytes
    pub fn create(name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(AppError::shm(name, "region size must be non-zero"));
        }

        let fd = shm_open(
            os_name(name).as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| AppError::shm(name, format!("shm_open(create) failed: {}", e)))?;

        let file = File::from(fd);
        file.set_len(len as u64)
            .map_err(|e| AppError::shm(name, format!("failed to size region: {}", e)))?;

        let region = Self::map(name, &file, len, true)?;
        info!("Created shared memory region '{}' ({} bytes)", name, len);
        Ok(region)
    }

    /// Attach to an existing region; its size is taken from the object itself
    pub fn attach(name: &str) -> Result<Self> {
        Self::try_attach(name)?
            .ok_or_else(|| AppError::shm(name, "shm_open(attach) failed: region does not exist"))
    }

    /// Like [`attach`](Self::attach), but `Ok(None)` when no region has this name
    pub fn try_attach(name: &str) -> Result<Option<Self>> {
        let fd = match shm_open(os_name(name).as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Ok(None),
            Err(e) => return Err(AppError::shm(name, format!("shm_open(attach) failed: {}", e))),
        };

        let file = File::from(fd);
        let len = file
            .metadata()
            .map_err(|e| AppError::shm(name, format!("failed to stat region: {}", e)))?
            .len() as usize;
        if len == 0 {
            return Err(AppError::shm(name, "region is empty"));
        }

        let region = Self::map(name, &file, len, false)?;
        debug!("Attached to shared memory region '{}' ({} bytes)", name, len);
        Ok(Some(region))
    }

    fn map(name: &str, file: &File, len: usize, owner: bool) -> Result<Self> {
        // SAFETY: the object is only resized at creation, before mapping
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(file) }
            .map_err(|e| AppError::shm(name, format!("mmap failed: {}", e)))?;
        let ptr = map.as_mut_ptr();

        Ok(Self {
            name: name.trim_start_matches('/').to_string(),
            map,
            ptr,
            owner,
            released: AtomicBool::new(false),
        })
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl SharedRegion for ShmRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) || !self.owner {
            return Ok(());
        }
        shm_unlink(os_name(&self.name).as_str())
            .map_err(|e| AppError::shm(&self.name, format!("shm_unlink failed: {}", e)))?;
        info!("Unlinked shared memory region '{}'", self.name);
        Ok(())
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner && !self.released.load(Ordering::SeqCst) {
            if let Err(e) = self.release() {
                warn!("Failed to release region on drop: {}", e);
            }
        }
    }
}
