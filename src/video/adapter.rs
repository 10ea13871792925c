//! Frame buffer to video frame adapter
//!
//! On every tick the adapter waits for the next presentation timestamp, reads
//! the renderer's active slot, and copies it into a cached top-down
//! [`RgbFrame`]. Rows are copied in reverse order straight out of the shared
//! region, so reshaping and the vertical flip happen in one pass without an
//! intermediate buffer. A geometry change allocates a fresh frame; otherwise
//! the cached frame is overwritten in place.

use std::time::Instant;
use tracing::{debug, info};

use super::clock::FrameClock;
use super::frame::RgbFrame;
use super::frame_buffer::FrameBuffer;
use crate::error::Result;

pub struct MediaTrackAdapter {
    buffer: FrameBuffer,
    clock: FrameClock,
    frame: Option<RgbFrame>,
    allocations: u64,
    frames: u64,
}

impl MediaTrackAdapter {
    pub fn new(buffer: FrameBuffer, fps: u32) -> Self {
        Self {
            buffer,
            clock: FrameClock::new(fps),
            frame: None,
            allocations: 0,
            frames: 0,
        }
    }

    pub fn fps(&self) -> u32 {
        self.clock.fps()
    }

    /// Output frames allocated so far
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Frames produced so far
    pub fn frames_produced(&self) -> u64 {
        self.frames
    }

    /// Produce the next timestamped frame.
    ///
    /// Errors from the frame buffer are returned as-is; `InvalidGeometry` is
    /// fatal and no frame is allocated for it.
    pub async fn produce_frame(&mut self) -> Result<&RgbFrame> {
        let (pts, time_base) = self.clock.next_timestamp().await;

        let (index, resolution) = self.buffer.active()?;

        let mut frame = match self.frame.take() {
            Some(frame) if frame.resolution == resolution => frame,
            old => {
                match old {
                    Some(old) => info!("Frame size changed {} -> {}", old.resolution, resolution),
                    None => debug!("Allocating first {} frame", resolution),
                }
                self.allocations += 1;
                RgbFrame::new(resolution, time_base)
            }
        };

        let filled = self.fill_flipped(&mut frame, index);
        let frame = self.frame.insert(frame);
        filled?;

        frame.pts = pts;
        frame.time_base = time_base;
        frame.updated_at = Instant::now();
        self.frames += 1;
        Ok(frame)
    }

    fn fill_flipped(&self, frame: &mut RgbFrame, index: usize) -> Result<()> {
        let resolution = frame.resolution;
        let stride = resolution.rgb_stride();
        let height = resolution.height as usize;
        for (row, out) in frame.data_mut().chunks_exact_mut(stride).enumerate() {
            self.buffer.read_row(index, resolution, height - 1 - row, out)?;
        }
        Ok(())
    }

    /// Last produced frame, if any
    pub fn current(&self) -> Option<&RgbFrame> {
        self.frame.as_ref()
    }
}
