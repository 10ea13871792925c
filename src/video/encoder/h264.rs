//! H.264 encoder using openh264
//!
//! RGB24 frames are converted to I420 and encoded to Annex-B access units,
//! which is what the WebRTC sample track packetizes. The encoder is rebuilt
//! whenever the frame size changes, and the first frame after a rebuild is a
//! key frame.

use bytes::Bytes;
use openh264::encoder::{Encoder as OpenH264Encoder, EncoderConfig as OpenH264Config, FrameType};
use openh264::formats::{RgbSliceU8, YUVBuffer};
use openh264::OpenH264API;
use std::borrow::Cow;
use tracing::{debug, info};

use super::traits::{EncodedFormat, EncodedFrame, Encoder, EncoderConfig};
use crate::error::{AppError, Result};
use crate::video::format::Resolution;
use crate::video::frame::RgbFrame;

pub struct H264Encoder {
    config: EncoderConfig,
    inner: Option<OpenH264Encoder>,
    /// Resolution `inner` was created for
    active: Option<Resolution>,
    force_keyframe: bool,
}

/// Largest even-sized resolution that fits, I420 needs 2x2 chroma blocks
fn even_resolution(res: Resolution) -> Resolution {
    Resolution::new(res.width & !1, res.height & !1)
}

/// Pixels of `frame` cropped to `target`, borrowing when no crop is needed
fn cropped<'a>(frame: &'a RgbFrame, target: Resolution) -> Cow<'a, [u8]> {
    if frame.resolution == target {
        return Cow::Borrowed(frame.data());
    }
    let stride = target.rgb_stride();
    let mut out = Vec::with_capacity(stride * target.height as usize);
    for row in 0..target.height as usize {
        out.extend_from_slice(&frame.row(row)[..stride]);
    }
    Cow::Owned(out)
}

impl H264Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            inner: None,
            active: None,
            force_keyframe: true,
        }
    }

    fn build(&self) -> Result<OpenH264Encoder> {
        let config = OpenH264Config::new()
            .set_bitrate_bps(self.config.bitrate_kbps.saturating_mul(1000))
            .max_frame_rate(self.config.fps as f32);
        OpenH264Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| AppError::VideoError(format!("Failed to create H264 encoder: {}", e)))
    }

    fn ensure_encoder(&mut self, resolution: Resolution) -> Result<()> {
        if self.inner.is_some() && self.active == Some(resolution) {
            return Ok(());
        }
        match self.active {
            Some(old) => info!("Rebuilding H264 encoder: {} -> {}", old, resolution),
            None => debug!("Creating H264 encoder for {}", resolution),
        }
        self.inner = Some(self.build()?);
        self.active = Some(resolution);
        self.force_keyframe = true;
        Ok(())
    }
}

impl Encoder for H264Encoder {
    fn name(&self) -> &str {
        "H264 (openh264)"
    }

    fn encode(&mut self, frame: &RgbFrame, sequence: u64) -> Result<EncodedFrame> {
        let target = even_resolution(frame.resolution);
        if !target.is_valid() {
            return Err(AppError::VideoError(format!(
                "{} is too small to encode as H264",
                frame.resolution
            )));
        }
        self.ensure_encoder(target)?;

        let pixels = cropped(frame, target);
        let yuv = YUVBuffer::from_rgb_source(RgbSliceU8::new(
            &pixels,
            (target.width as usize, target.height as usize),
        ));

        let force = std::mem::take(&mut self.force_keyframe);
        let encoder = self
            .inner
            .as_mut()
            .ok_or_else(|| AppError::VideoError("H264 encoder not initialized".to_string()))?;
        if force {
            encoder.force_intra_frame();
        }
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| AppError::VideoError(format!("H264 encode failed: {}", e)))?;

        let key_frame = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        Ok(EncodedFrame::new(
            Bytes::from(bitstream.to_vec()),
            EncodedFormat::H264,
            target,
            key_frame,
            sequence,
            frame.pts,
        ))
    }

    fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }
}
