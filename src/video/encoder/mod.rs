//! Video encoder implementations
//!
//! - H264 (openh264) for WebRTC tracks
//! - JPEG (turbojpeg) for the MJPEG fallback stream

pub mod h264;
pub mod jpeg;
pub mod traits;

pub use h264::H264Encoder;
pub use jpeg::JpegEncoder;
pub use traits::{EncodedFormat, EncodedFrame, Encoder, EncoderConfig};
