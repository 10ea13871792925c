//! Frames from the renderer to the wire
//!
//! ```text
//! FrameBuffer (shared regions) -> MediaTrackAdapter -> Encoder -> FrameSink
//!                                  ^ FrameClock
//! ```

pub mod adapter;
pub mod clock;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod frame_buffer;
pub mod pump;

pub use adapter::MediaTrackAdapter;
pub use clock::{FrameClock, VIDEO_CLOCK_RATE, VIDEO_TIME_BASE};
pub use encoder::{H264Encoder, JpegEncoder};
pub use format::Resolution;
pub use frame::{RgbFrame, TimeBase};
pub use frame_buffer::{FrameBuffer, FrameBufferMetadata};
pub use pump::{run_pump, FrameSink};
