//! Video frame data structures

use std::time::Instant;

use super::format::Resolution;

/// Rational time base of presentation timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }
}

/// Top-down packed RGB24 frame ready for encoding
#[derive(Debug, Clone)]
pub struct RgbFrame {
    data: Vec<u8>,
    /// Frame resolution
    pub resolution: Resolution,
    /// Presentation timestamp in `time_base` units
    pub pts: u64,
    pub time_base: TimeBase,
    /// When the pixels were last copied out of the frame buffer
    pub updated_at: Instant,
}

impl RgbFrame {
    /// Allocate a zeroed frame
    pub fn new(resolution: Resolution, time_base: TimeBase) -> Self {
        let len = resolution.rgb_len().unwrap_or(0);
        Self {
            data: vec![0u8; len],
            resolution,
            pts: 0,
            time_base,
            updated_at: Instant::now(),
        }
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Row `row` counted from the top
    pub fn row(&self, row: usize) -> &[u8] {
        let stride = self.resolution.rgb_stride();
        &self.data[row * stride..(row + 1) * stride]
    }
}
