//! H.264 sample track and the pump sink that writes into it

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{AppError, Result};
use crate::video::clock::VIDEO_CLOCK_RATE;
use crate::video::encoder::EncodedFrame;
use crate::video::pump::FrameSink;

/// Stream ID shared by every video track
pub const STREAM_ID: &str = "vizstream";

/// Constrained baseline, matching what openh264 produces
pub fn h264_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    }
}

pub fn h264_track(track_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        h264_codec_capability(),
        track_id.to_string(),
        STREAM_ID.to_string(),
    ))
}

/// Who is watching a track and whether one of them needs a key frame
#[derive(Debug, Default)]
pub struct TrackDemand {
    viewers: AtomicUsize,
    keyframe: AtomicBool,
    joined: Notify,
}

impl TrackDemand {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn viewers(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// A new viewer always starts with a key frame
    pub fn join(&self) {
        self.viewers.fetch_add(1, Ordering::SeqCst);
        self.request_keyframe();
        self.joined.notify_one();
    }

    pub fn leave(&self) {
        let _ = self
            .viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn request_keyframe(&self) {
        self.keyframe.store(true, Ordering::SeqCst);
    }

    fn take_keyframe(&self) -> bool {
        self.keyframe.swap(false, Ordering::SeqCst)
    }

    async fn wait_for_viewers(&self) {
        loop {
            let notified = self.joined.notified();
            if self.viewers() > 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Pump sink writing H.264 access units as samples of `1/fps`
pub struct TrackSink {
    track: Arc<TrackLocalStaticSample>,
    demand: Arc<TrackDemand>,
    frame_duration: Duration,
}

impl TrackSink {
    pub fn new(track: Arc<TrackLocalStaticSample>, demand: Arc<TrackDemand>, fps: u32) -> Self {
        Self {
            track,
            demand,
            frame_duration: Duration::from_secs(1) / fps.max(1),
        }
    }
}

#[async_trait]
impl FrameSink for TrackSink {
    async fn ready(&mut self) {
        self.demand.wait_for_viewers().await
    }

    fn wants_keyframe(&mut self) -> bool {
        self.demand.take_keyframe()
    }

    async fn deliver(&mut self, frame: EncodedFrame) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data: frame.data,
                duration: self.frame_duration,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to write sample: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_requests_keyframe() {
        let demand = TrackDemand::new();
        assert!(!demand.take_keyframe());
        demand.join();
        assert_eq!(demand.viewers(), 1);
        assert!(demand.take_keyframe());
        assert!(!demand.take_keyframe());
    }

    #[test]
    fn test_leave_never_underflows() {
        let demand = TrackDemand::new();
        demand.leave();
        assert_eq!(demand.viewers(), 0);
    }

    #[test]
    fn test_ready_waits_for_first_viewer() {
        use tokio_test::{assert_pending, assert_ready, task};

        let demand = TrackDemand::new();
        let mut sink = TrackSink::new(h264_track("video0"), demand.clone(), 30);
        assert_eq!(sink.frame_duration, Duration::from_nanos(33_333_333));

        let mut ready = task::spawn(sink.ready());
        assert_pending!(ready.poll());
        demand.join();
        assert!(ready.is_woken());
        assert_ready!(ready.poll());
    }

    #[tokio::test]
    async fn test_write_without_bindings_is_ok() {
        let demand = TrackDemand::new();
        let mut sink = TrackSink::new(h264_track("video0"), demand, 30);
        let frame = EncodedFrame::new(
            bytes::Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            crate::video::encoder::EncodedFormat::H264,
            crate::video::format::Resolution::VGA,
            true,
            0,
            0,
        );
        assert!(sink.deliver(frame).await.is_ok());
    }
}
