//! Presentation timestamps for the video track
//!
//! Mirrors a 90 kHz RTP video clock. The first call yields pts 0 at once;
//! every later call advances by one frame period and sleeps until the wall
//! clock catches up.

use std::time::Duration;
use tokio::time::Instant;

use super::frame::TimeBase;

/// RTP video clock rate
pub const VIDEO_CLOCK_RATE: u32 = 90_000;
/// Time base of every produced frame
pub const VIDEO_TIME_BASE: TimeBase = TimeBase::new(1, VIDEO_CLOCK_RATE);

/// Paces frame production at a fixed rate
#[derive(Debug)]
pub struct FrameClock {
    fps: u32,
    start: Option<Instant>,
    pts: u64,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.clamp(1, VIDEO_CLOCK_RATE),
            start: None,
            pts: 0,
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Ticks per frame
    pub fn ticks_per_frame(&self) -> u64 {
        (VIDEO_CLOCK_RATE / self.fps) as u64
    }

    /// Wall-clock duration of one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps as f64)
    }

    /// Next presentation timestamp and time base.
    ///
    /// This is the only suspension point of frame production.
    pub async fn next_timestamp(&mut self) -> (u64, TimeBase) {
        match self.start {
            None => {
                self.start = Some(Instant::now());
                self.pts = 0;
            }
            Some(start) => {
                self.pts += self.ticks_per_frame();
                let due = start + Duration::from_secs_f64(self.pts as f64 / VIDEO_CLOCK_RATE as f64);
                tokio::time::sleep_until(due).await;
            }
        }
        (self.pts, VIDEO_TIME_BASE)
    }

    /// Restart from pts 0 on the next call
    pub fn reset(&mut self) {
        self.start = None;
        self.pts = 0;
    }
}
