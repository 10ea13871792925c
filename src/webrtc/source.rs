//! Video source for peer connections
//!
//! In broadcast mode every peer receives the same track, fed by one pump that
//! starts with the first peer and idles while nobody watches. Otherwise each
//! peer gets its own track and pump, stopped when the peer lets go of its
//! [`TrackLease`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::track::{h264_track, TrackDemand, TrackSink};
use crate::lifecycle::ShutdownHandle;
use crate::video::adapter::MediaTrackAdapter;
use crate::video::encoder::{EncoderConfig, H264Encoder};
use crate::video::format::Resolution;
use crate::video::frame_buffer::FrameBuffer;
use crate::video::pump::run_pump;

#[derive(Clone)]
struct SharedTrack {
    track: Arc<TrackLocalStaticSample>,
    demand: Arc<TrackDemand>,
}

pub struct VideoSource {
    frames: FrameBuffer,
    fps: u32,
    bitrate_kbps: u32,
    broadcast: bool,
    shutdown: ShutdownHandle,
    shared: Mutex<Option<SharedTrack>>,
}

impl VideoSource {
    pub fn new(
        frames: FrameBuffer,
        fps: u32,
        bitrate_kbps: u32,
        broadcast: bool,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            frames,
            fps,
            bitrate_kbps,
            broadcast,
            shutdown,
            shared: Mutex::new(None),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Viewers of the shared track, or `None` when not broadcasting or not started
    pub fn shared_viewers(&self) -> Option<usize> {
        self.shared.lock().as_ref().map(|s| s.demand.viewers())
    }

    /// Hand out a track for one peer. Must be called from within the runtime.
    pub fn subscribe(&self, peer_id: &str) -> TrackLease {
        if self.broadcast {
            let shared = {
                let mut guard = self.shared.lock();
                match guard.as_ref() {
                    Some(shared) => shared.clone(),
                    None => {
                        let shared = SharedTrack {
                            track: h264_track("video"),
                            demand: TrackDemand::new(),
                        };
                        self.spawn_pump(
                            "broadcast".to_string(),
                            shared.track.clone(),
                            shared.demand.clone(),
                            self.shutdown.child_token(),
                        );
                        *guard = Some(shared.clone());
                        shared
                    }
                }
            };
            shared.demand.join();
            debug!("Peer {} joined broadcast ({} viewers)", peer_id, shared.demand.viewers());
            TrackLease {
                track: shared.track,
                demand: shared.demand,
                cancel: None,
            }
        } else {
            let track = h264_track(&format!("video-{}", peer_id));
            let demand = TrackDemand::new();
            let cancel = self.shutdown.child_token();
            self.spawn_pump(format!("peer {}", peer_id), track.clone(), demand.clone(), cancel.clone());
            demand.join();
            TrackLease {
                track,
                demand,
                cancel: Some(cancel),
            }
        }
    }

    fn spawn_pump(
        &self,
        label: String,
        track: Arc<TrackLocalStaticSample>,
        demand: Arc<TrackDemand>,
        cancel: CancellationToken,
    ) {
        let initial = self
            .frames
            .active()
            .map(|(_, resolution)| resolution)
            .unwrap_or(Resolution::VGA);
        let adapter = MediaTrackAdapter::new(self.frames.clone(), self.fps);
        let encoder = H264Encoder::new(EncoderConfig::h264(initial, self.bitrate_kbps, self.fps));
        let sink = TrackSink::new(track, demand, self.fps);
        let shutdown = self.shutdown.clone();

        info!("Starting {} video pump", label);
        tokio::spawn(async move {
            if let Err(e) = run_pump(&label, adapter, Box::new(encoder), sink, cancel, shutdown).await {
                error!("{} video pump stopped: {}", label, e);
            }
        });
    }
}

/// One peer's hold on a video track
pub struct TrackLease {
    track: Arc<TrackLocalStaticSample>,
    demand: Arc<TrackDemand>,
    cancel: Option<CancellationToken>,
}

impl TrackLease {
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn demand(&self) -> Arc<TrackDemand> {
        self.demand.clone()
    }

    /// Whether this lease owns its pump
    pub fn is_dedicated(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for TrackLease {
    fn drop(&mut self) {
        self.demand.leave();
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(broadcast: bool, shutdown: ShutdownHandle) -> VideoSource {
        let res = Resolution::new(16, 16);
        let frames = FrameBuffer::in_process(1, res, res).unwrap();
        VideoSource::new(frames, 30, 500, broadcast, shutdown)
    }

    #[tokio::test]
    async fn test_broadcast_shares_one_track() {
        let shutdown = ShutdownHandle::new();
        let source = source(true, shutdown.clone());
        assert_eq!(source.shared_viewers(), None);

        let a = source.subscribe("a");
        let b = source.subscribe("b");
        assert!(Arc::ptr_eq(&a.track(), &b.track()));
        assert!(!a.is_dedicated());
        assert_eq!(source.shared_viewers(), Some(2));

        drop(a);
        assert_eq!(source.shared_viewers(), Some(1));
        drop(b);
        assert_eq!(source.shared_viewers(), Some(0));
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_per_peer_tracks_are_independent() {
        let shutdown = ShutdownHandle::new();
        let source = source(false, shutdown.clone());

        let a = source.subscribe("a");
        let b = source.subscribe("b");
        assert!(!Arc::ptr_eq(&a.track(), &b.track()));
        assert!(a.is_dedicated());
        assert_eq!(source.shared_viewers(), None);
        shutdown.trigger();
    }
}
