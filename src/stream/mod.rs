//! Motion-JPEG fallback stream
//!
//! - `MjpegStreamHandler` - latest-frame hub shared by HTTP clients
//! - `MjpegSink` - pump sink feeding the hub

pub mod mjpeg;

pub use mjpeg::{create_mjpeg_part, ClientGuard, JpegFrame, MjpegSink, MjpegStreamHandler, MJPEG_BOUNDARY};
