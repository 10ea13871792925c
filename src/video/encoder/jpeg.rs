//! JPEG encoder implementation
//!
//! Frames are already top-down RGB24, so turbojpeg compresses them directly
//! with 4:2:0 chroma subsampling.

use bytes::Bytes;

use super::traits::{EncodedFormat, EncodedFrame, Encoder, EncoderConfig};
use crate::error::{AppError, Result};
use crate::video::format::Resolution;
use crate::video::frame::RgbFrame;

/// JPEG encoder using turbojpeg
///
/// Note: This encoder is NOT thread-safe due to turbojpeg limitations.
/// Use it from a single thread or wrap in a Mutex.
pub struct JpegEncoder {
    config: EncoderConfig,
    compressor: turbojpeg::Compressor,
}

impl JpegEncoder {
    /// Create a new JPEG encoder
    pub fn new(config: EncoderConfig) -> Result<Self> {
        let mut compressor = turbojpeg::Compressor::new().map_err(|e| {
            AppError::VideoError(format!("Failed to create turbojpeg compressor: {}", e))
        })?;

        compressor
            .set_quality(config.quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::VideoError(format!("Failed to set JPEG quality: {}", e)))?;
        compressor
            .set_subsamp(turbojpeg::Subsamp::Sub2x2)
            .map_err(|e| AppError::VideoError(format!("Failed to set JPEG subsampling: {}", e)))?;

        Ok(Self { config, compressor })
    }

    /// Create with specific quality
    pub fn with_quality(resolution: Resolution, quality: u32) -> Result<Self> {
        Self::new(EncoderConfig::jpeg(resolution, quality))
    }

    /// Set JPEG quality (1-100)
    pub fn set_quality(&mut self, quality: u32) -> Result<()> {
        self.compressor
            .set_quality(quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::VideoError(format!("Failed to set JPEG quality: {}", e)))?;
        self.config.quality = quality;
        Ok(())
    }

    /// Encode packed RGB24 to JPEG
    pub fn encode_rgb(&mut self, data: &[u8], resolution: Resolution) -> Result<Vec<u8>> {
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        let expected_size = width * height * 3;

        if data.len() < expected_size {
            return Err(AppError::VideoError(format!(
                "RGB data too small: {} < {}",
                data.len(),
                expected_size
            )));
        }

        let image = turbojpeg::Image {
            pixels: &data[..expected_size],
            width,
            pitch: width * 3,
            height,
            format: turbojpeg::PixelFormat::RGB,
        };

        self.compressor
            .compress_to_vec(image)
            .map_err(|e| AppError::VideoError(format!("JPEG compression failed: {}", e)))
    }
}

impl Encoder for JpegEncoder {
    fn name(&self) -> &str {
        "JPEG (turbojpeg)"
    }

    fn encode(&mut self, frame: &RgbFrame, sequence: u64) -> Result<EncodedFrame> {
        let jpeg = self.encode_rgb(frame.data(), frame.resolution)?;
        Ok(EncodedFrame::new(
            Bytes::from(jpeg),
            EncodedFormat::Jpeg,
            frame.resolution,
            true,
            sequence,
            frame.pts,
        ))
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::clock::VIDEO_TIME_BASE;

    #[test]
    fn test_encode_produces_jpeg_markers() {
        let mut encoder = JpegEncoder::with_quality(Resolution::new(16, 8), 80).unwrap();
        let frame = RgbFrame::new(Resolution::new(16, 8), VIDEO_TIME_BASE);
        let encoded = encoder.encode(&frame, 7).unwrap();

        assert_eq!(encoded.format, EncodedFormat::Jpeg);
        assert_eq!(encoded.sequence, 7);
        assert!(encoded.key_frame);
        assert_eq!(&encoded.data[..2], &[0xFF, 0xD8]);
        assert_eq!(&encoded.data[encoded.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_short_input_rejected() {
        let mut encoder = JpegEncoder::with_quality(Resolution::new(4, 4), 80).unwrap();
        assert!(encoder.encode_rgb(&[0u8; 10], Resolution::new(4, 4)).is_err());
    }
}
