//! Named byte regions shared with the rendering process
//!
//! Both the frame buffer and the event queue sit on top of [`SharedRegion`],
//! a named, fixed-size, readable/writable block of memory. Two backends exist:
//!
//! - [`ShmRegion`] - POSIX shared memory (`/dev/shm/<name>`), used when the
//!   renderer lives in another process
//! - [`HeapRegion`] - an in-process buffer, used when the renderer runs in the
//!   same process or in tests
//!
//! Regions are always 8-byte aligned so that the control words can be viewed
//! as `AtomicU64`.

mod heap;
mod posix;

pub use heap::HeapRegion;
pub use posix::ShmRegion;

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::error::{AppError, Result};

/// A named region of memory that can be shared across process boundaries
pub trait SharedRegion: Send + Sync + fmt::Debug {
    /// Region name (without the leading slash for POSIX regions)
    fn name(&self) -> &str;

    /// Region size in bytes
    fn len(&self) -> usize;

    /// Base pointer of the mapping. Valid and 8-byte aligned for the lifetime of `self`.
    fn as_ptr(&self) -> *mut u8;

    /// Release the OS resources behind the region.
    ///
    /// Idempotent. The mapping itself stays valid until the region is dropped,
    /// so readers holding a reference never observe unmapped memory.
    fn release(&self) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the region as a slice of 64-bit atomic words
    fn words(&self) -> &[AtomicU64] {
        // SAFETY: both backends guarantee 8-byte alignment and a mapping that
        // lives as long as `self`; AtomicU64 has the same layout as u64.
        unsafe { std::slice::from_raw_parts(self.as_ptr() as *const AtomicU64, self.len() / 8) }
    }

    /// Copy `out.len()` bytes starting at `offset` out of the region
    fn read_into(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        check_bounds(self.name(), self.len(), offset, out.len())?;
        // SAFETY: bounds checked above; the source may be concurrently written by
        // another process, which at worst yields a torn frame, never UB on our side
        // because we only copy plain bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`
    fn write_from(&self, offset: usize, data: &[u8]) -> Result<()> {
        check_bounds(self.name(), self.len(), offset, data.len())?;
        // SAFETY: bounds checked above
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

fn check_bounds(name: &str, len: usize, offset: usize, count: usize) -> Result<()> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(AppError::shm(
            name,
            format!("access of {} bytes at {} out of bounds (size {})", count, offset, len),
        )),
    }
}

/// How a named region is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a fresh region; fails if the name is taken
    Create,
    /// Attach to a region created by someone else
    Attach,
    /// Attach if the region exists, otherwise create it
    AttachOrCreate,
}

/// Where a region lives, as selected by configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSource {
    /// POSIX shared memory object with this name
    Named(String),
    /// In-process buffer; the label is only used in logs
    InProcess(String),
}

impl RegionSource {
    /// Named when a name is given, in-process otherwise
    pub fn from_name(name: Option<&str>, label: &str) -> Self {
        match name {
            Some(name) if !name.is_empty() => RegionSource::Named(name.to_string()),
            _ => RegionSource::InProcess(label.to_string()),
        }
    }

    pub fn is_named(&self) -> bool {
        matches!(self, RegionSource::Named(_))
    }

    /// Open the region. `size` is required when the region may be created.
    pub fn open(&self, size: usize, mode: OpenMode) -> Result<Arc<dyn SharedRegion>> {
        match self {
            RegionSource::Named(name) => {
                let region = match mode {
                    OpenMode::Create => ShmRegion::create(name, size)?,
                    OpenMode::Attach => ShmRegion::attach(name)?,
                    OpenMode::AttachOrCreate => match ShmRegion::try_attach(name)? {
                        Some(region) => region,
                        None => ShmRegion::create(name, size)?,
                    },
                };
                Ok(Arc::new(region))
            }
            RegionSource::InProcess(label) => Ok(Arc::new(HeapRegion::new(label.clone(), size)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_region_source_from_name() {
        assert_eq!(
            RegionSource::from_name(Some("frames"), "info"),
            RegionSource::Named("frames".into())
        );
        assert_eq!(
            RegionSource::from_name(Some(""), "info"),
            RegionSource::InProcess("info".into())
        );
        assert!(!RegionSource::from_name(None, "info").is_named());
    }

    #[test]
    fn test_read_write_bounds() {
        let region = HeapRegion::new("bounds", 16).unwrap();
        region.write_from(8, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(region.write_from(9, &[0; 8]).is_err());

        let mut out = [0u8; 8];
        region.read_into(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(region.read_into(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn test_offsets_near_usize_max_are_errors() {
        let region = HeapRegion::new("bounds", 16).unwrap();
        let mut out = [0u8; 8];
        for offset in [usize::MAX - 2, usize::MAX - 7, usize::MAX] {
            assert!(region.read_into(offset, &mut out).is_err());
            assert!(region.write_from(offset, &out).is_err());
        }
    }

    #[test]
    fn test_words_view_shares_bytes() {
        let region = HeapRegion::new("words", 24).unwrap();
        assert_eq!(region.words().len(), 3);
        region.words()[1].store(0x0102, Ordering::SeqCst);

        let mut out = [0u8; 8];
        region.read_into(8, &mut out).unwrap();
        assert_eq!(u64::from_ne_bytes(out), 0x0102);
    }
}
