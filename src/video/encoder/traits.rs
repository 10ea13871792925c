//! Encoder traits and common types

use bytes::Bytes;

use crate::error::Result;
use crate::video::format::Resolution;
use crate::video::frame::RgbFrame;

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Initial resolution; encoders follow the frames they are given
    pub resolution: Resolution,
    /// Output quality (1-100 for JPEG)
    pub quality: u32,
    /// Target bitrate (H264)
    pub bitrate_kbps: u32,
    /// Target frame rate
    pub fps: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::VGA,
            quality: 80,
            bitrate_kbps: 2000,
            fps: 30,
        }
    }
}

impl EncoderConfig {
    pub fn jpeg(resolution: Resolution, quality: u32) -> Self {
        Self {
            resolution,
            quality,
            ..Default::default()
        }
    }

    pub fn h264(resolution: Resolution, bitrate_kbps: u32, fps: u32) -> Self {
        Self {
            resolution,
            bitrate_kbps,
            fps,
            ..Default::default()
        }
    }
}

/// Encoded frame output
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Encoded data
    pub data: Bytes,
    pub format: EncodedFormat,
    pub resolution: Resolution,
    /// Whether this is a key frame
    pub key_frame: bool,
    /// Frame sequence number
    pub sequence: u64,
    /// Presentation timestamp copied from the source frame
    pub pts: u64,
}

impl EncodedFrame {
    pub fn new(
        data: Bytes,
        format: EncodedFormat,
        resolution: Resolution,
        key_frame: bool,
        sequence: u64,
        pts: u64,
    ) -> Self {
        Self {
            data,
            format,
            resolution,
            key_frame,
            sequence,
            pts,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Encoded output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedFormat {
    Jpeg,
    H264,
}

impl std::fmt::Display for EncodedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodedFormat::Jpeg => write!(f, "JPEG"),
            EncodedFormat::H264 => write!(f, "H.264"),
        }
    }
}

/// Generic encoder trait
/// Note: Not Sync because neither turbojpeg nor openh264 handles are thread-safe
pub trait Encoder: Send {
    /// Get encoder name
    fn name(&self) -> &str;

    /// Encode one top-down RGB24 frame
    fn encode(&mut self, frame: &RgbFrame, sequence: u64) -> Result<EncodedFrame>;

    /// Make the next output a key frame
    fn request_keyframe(&mut self) {}

    /// Get current configuration
    fn config(&self) -> &EncoderConfig;
}
