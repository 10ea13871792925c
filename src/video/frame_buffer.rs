//! Shared frame buffer written by the renderer
//!
//! The metadata region is six `u64` words:
//!
//! ```text
//! [buffer_count, active_index, width_0, height_0, width_1, height_1]
//! ```
//!
//! Each image region holds packed RGB24 with row 0 at the bottom. The renderer
//! writes the pixels of a slot first, then its geometry, then flips
//! `active_index`, so a reader that sees the new index also sees its geometry.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use super::format::Resolution;
use crate::error::{AppError, Result};
use crate::shm::{OpenMode, RegionSource, SharedRegion};

/// Number of u64 words in the metadata region
pub const METADATA_WORDS: usize = 6;
/// Size of the metadata region in bytes
pub const METADATA_BYTES: usize = METADATA_WORDS * 8;
/// Slots described by the metadata header
pub const MAX_SLOTS: usize = 2;

const BUFFER_COUNT: usize = 0;
const ACTIVE_INDEX: usize = 1;

fn width_word(slot: usize) -> usize {
    2 + slot * 2
}

fn height_word(slot: usize) -> usize {
    3 + slot * 2
}

/// Decoded metadata header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferMetadata {
    pub buffer_count: u64,
    pub active_index: u64,
    pub slots: [(u64, u64); MAX_SLOTS],
}

/// Metadata region plus one image region per slot
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    metadata: Arc<dyn SharedRegion>,
    images: Vec<Arc<dyn SharedRegion>>,
}

impl FrameBuffer {
    pub fn from_regions(
        metadata: Arc<dyn SharedRegion>,
        images: Vec<Arc<dyn SharedRegion>>,
    ) -> Result<Self> {
        if metadata.words().len() < METADATA_WORDS {
            return Err(AppError::shm(
                metadata.name(),
                format!(
                    "metadata region needs {} bytes, has {}",
                    METADATA_BYTES,
                    metadata.len()
                ),
            ));
        }
        if images.is_empty() {
            return Err(AppError::Config("at least one image buffer is required".to_string()));
        }
        if images.len() > MAX_SLOTS {
            return Err(AppError::Config(format!(
                "at most {} image buffers are supported, got {}",
                MAX_SLOTS,
                images.len()
            )));
        }
        Ok(Self { metadata, images })
    }

    /// Attach to regions published by the renderer
    pub fn attach(info: &RegionSource, images: &[RegionSource]) -> Result<Self> {
        let metadata = info.open(METADATA_BYTES, OpenMode::Attach)?;
        let images = images
            .iter()
            .map(|source| source.open(0, OpenMode::Attach))
            .collect::<Result<Vec<_>>>()?;
        let buffer = Self::from_regions(metadata, images)?;
        info!(
            "Attached frame buffer '{}' with {} image region(s)",
            buffer.metadata.name(),
            buffer.images.len()
        );
        Ok(buffer)
    }

    /// In-process buffer sized for `max` frames, initialised to a black frame
    /// of `initial` size in slot 0
    pub fn in_process(slots: usize, max: Resolution, initial: Resolution) -> Result<Self> {
        let image_len = max
            .rgb_len()
            .filter(|len| *len > 0)
            .ok_or_else(|| AppError::InvalidGeometry(format!("buffer size {}", max)))?;
        let metadata = RegionSource::InProcess("frame-info".to_string())
            .open(METADATA_BYTES, OpenMode::Create)?;
        let images = (0..slots)
            .map(|i| RegionSource::InProcess(format!("frame-image-{}", i)).open(image_len, OpenMode::Create))
            .collect::<Result<Vec<_>>>()?;
        let buffer = Self::from_regions(metadata, images)?;

        let words = buffer.metadata.words();
        words[BUFFER_COUNT].store(slots as u64, Ordering::Release);
        for slot in 0..slots {
            words[width_word(slot)].store(initial.width as u64, Ordering::Release);
            words[height_word(slot)].store(initial.height as u64, Ordering::Release);
        }
        debug!("In-process frame buffer: {} slot(s) of {} bytes", slots, image_len);
        Ok(buffer)
    }

    pub fn metadata(&self) -> FrameBufferMetadata {
        let words = self.metadata.words();
        let load = |i: usize| words[i].load(Ordering::Acquire);
        FrameBufferMetadata {
            buffer_count: load(BUFFER_COUNT),
            active_index: load(ACTIVE_INDEX),
            slots: [
                (load(width_word(0)), load(height_word(0))),
                (load(width_word(1)), load(height_word(1))),
            ],
        }
    }

    /// Active slot and its validated geometry.
    ///
    /// Every failure here is `InvalidGeometry`: the renderer published a header
    /// that cannot describe a frame this process can read.
    pub fn active(&self) -> Result<(usize, Resolution)> {
        let meta = self.metadata();
        let index = meta.active_index as usize;
        if meta.active_index >= MAX_SLOTS as u64 || index >= self.images.len() {
            return Err(AppError::InvalidGeometry(format!(
                "active buffer index {} out of range ({} image buffers)",
                meta.active_index,
                self.images.len()
            )));
        }

        let (width, height) = meta.slots[index];
        if width == 0 || height == 0 || width > u32::MAX as u64 || height > u32::MAX as u64 {
            return Err(AppError::InvalidGeometry(format!(
                "slot {} reports {}x{}",
                index, width, height
            )));
        }
        let resolution = Resolution::new(width as u32, height as u32);

        let needed = resolution
            .rgb_len()
            .ok_or_else(|| AppError::InvalidGeometry(format!("{} overflows", resolution)))?;
        let available = self.images[index].len();
        if available < needed {
            return Err(AppError::InvalidGeometry(format!(
                "slot {} is {} but region '{}' holds only {} bytes",
                index,
                resolution,
                self.images[index].name(),
                available
            )));
        }
        Ok((index, resolution))
    }

    /// Copy one bottom-up row of slot `index` into `out`
    pub fn read_row(&self, index: usize, resolution: Resolution, row: usize, out: &mut [u8]) -> Result<()> {
        let region = self
            .images
            .get(index)
            .ok_or_else(|| AppError::InvalidGeometry(format!("no image buffer {}", index)))?;
        region.read_into(row * resolution.rgb_stride(), out)
    }

    /// Publish a frame into `index` the way the renderer does.
    ///
    /// Used when the renderer lives in this process and by tests.
    pub fn publish(&self, index: usize, resolution: Resolution, pixels: &[u8]) -> Result<()> {
        let region = self
            .images
            .get(index)
            .ok_or_else(|| AppError::BadRequest(format!("no image buffer {}", index)))?;
        let len = resolution
            .rgb_len()
            .filter(|len| *len == pixels.len())
            .ok_or_else(|| {
                AppError::BadRequest(format!(
                    "{} bytes do not describe a {} RGB frame",
                    pixels.len(),
                    resolution
                ))
            })?;
        region.write_from(0, &pixels[..len])?;

        let words = self.metadata.words();
        words[width_word(index)].store(resolution.width as u64, Ordering::Release);
        words[height_word(index)].store(resolution.height as u64, Ordering::Release);
        words[ACTIVE_INDEX].store(index as u64, Ordering::Release);
        Ok(())
    }

    /// Drop the OS resources behind all regions
    pub fn release(&self) -> Result<()> {
        let mut result = self.metadata.release();
        for image in &self.images {
            result = result.and(image.release());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::HeapRegion;

    fn buffer(image_len: usize) -> FrameBuffer {
        let meta: Arc<dyn SharedRegion> = Arc::new(HeapRegion::new("info", METADATA_BYTES).unwrap());
        let image: Arc<dyn SharedRegion> = Arc::new(HeapRegion::new("img", image_len).unwrap());
        FrameBuffer::from_regions(meta, vec![image]).unwrap()
    }

    fn set_words(buffer: &FrameBuffer, values: [u64; METADATA_WORDS]) {
        for (word, value) in buffer.metadata.words().iter().zip(values) {
            word.store(value, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_active_geometry() {
        let fb = buffer(4 * 2 * 3);
        set_words(&fb, [1, 0, 4, 2, 0, 0]);
        assert_eq!(fb.active().unwrap(), (0, Resolution::new(4, 2)));
    }

    #[test]
    fn test_zero_dimension_is_fatal() {
        let fb = buffer(64);
        set_words(&fb, [1, 0, 0, 2, 0, 0]);
        let err = fb.active().unwrap_err();
        assert!(err.is_fatal());

        set_words(&fb, [1, 0, 3, 0, 0, 0]);
        assert!(fb.active().unwrap_err().is_fatal());
    }

    #[test]
    fn test_index_out_of_range_is_fatal() {
        let fb = buffer(64);
        set_words(&fb, [2, 1, 2, 2, 2, 2]);
        assert!(fb.active().unwrap_err().is_fatal());
    }

    #[test]
    fn test_region_too_small_is_fatal() {
        let fb = buffer(10);
        set_words(&fb, [1, 0, 2, 2, 0, 0]);
        assert!(fb.active().unwrap_err().is_fatal());
    }

    #[test]
    fn test_publish_switches_active_slot() {
        let fb = FrameBuffer::in_process(2, Resolution::new(4, 4), Resolution::new(4, 4)).unwrap();
        assert_eq!(fb.metadata().buffer_count, 2);

        fb.publish(1, Resolution::new(2, 1), &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(fb.active().unwrap(), (1, Resolution::new(2, 1)));

        let mut row = [0u8; 6];
        fb.read_row(1, Resolution::new(2, 1), 0, &mut row).unwrap();
        assert_eq!(row, [1, 2, 3, 4, 5, 6]);

        assert!(fb.publish(1, Resolution::new(2, 2), &[0; 6]).is_err());
    }

    #[test]
    fn test_too_many_slots_rejected() {
        let meta: Arc<dyn SharedRegion> = Arc::new(HeapRegion::new("info", METADATA_BYTES).unwrap());
        let images: Vec<Arc<dyn SharedRegion>> = (0..3)
            .map(|i| Arc::new(HeapRegion::new(format!("img{}", i), 8).unwrap()) as Arc<dyn SharedRegion>)
            .collect();
        assert!(FrameBuffer::from_regions(meta, images).is_err());
    }
}
