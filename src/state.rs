use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::Result;
use crate::lifecycle::{shutdown_connections, ShutdownHandle, ShutdownReport};
use crate::queue::CircularQueue;
use crate::shm::OpenMode;
use crate::stream::{MjpegSink, MjpegStreamHandler};
use crate::video::adapter::MediaTrackAdapter;
use crate::video::encoder::JpegEncoder;
use crate::video::frame_buffer::FrameBuffer;
use crate::video::pump::run_pump;
use crate::web::registry::WsRegistry;
use crate::webrtc::{PeerConnectionSet, VideoSource};

/// Which entry point the server was started as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Video (WebRTC, optional MJPEG) plus input
    Streaming,
    /// Input only
    Interaction,
}

/// Per-server state shared across handlers
///
/// Optional parts are `None` when the current mode or configuration does not
/// provide them; the matching routes are then not mounted.
pub struct AppState {
    pub mode: ServerMode,
    /// Effective configuration (persisted values with command line overrides)
    pub config: Arc<AppConfig>,
    pub peers: Arc<PeerConnectionSet>,
    pub sockets: Arc<WsRegistry>,
    /// Input event queue
    pub queue: Option<Arc<CircularQueue>>,
    /// Renderer frames
    pub frames: Option<FrameBuffer>,
    /// Track source for `/offer`
    pub video: Option<Arc<VideoSource>>,
    /// `/video/mjpeg` hub
    pub mjpeg: Option<Arc<MjpegStreamHandler>>,
    pub shutdown: ShutdownHandle,
}

impl AppState {
    pub fn new(mode: ServerMode, config: AppConfig, shutdown: ShutdownHandle) -> Self {
        Self {
            mode,
            config: Arc::new(config),
            peers: Arc::new(PeerConnectionSet::new()),
            sockets: WsRegistry::new(),
            queue: None,
            frames: None,
            video: None,
            mjpeg: None,
            shutdown,
        }
    }

    /// Open the regions the configuration names and start the MJPEG producer.
    ///
    /// Must run inside the runtime.
    pub fn build(mode: ServerMode, config: AppConfig, shutdown: ShutdownHandle) -> Result<Self> {
        let mut state = Self::new(mode, config, shutdown);
        let config = state.config.clone();

        if config.queue.enabled {
            let open_mode = if config.queue.create {
                OpenMode::Create
            } else {
                OpenMode::AttachOrCreate
            };
            let queue = CircularQueue::open(
                &config.queue.head_tail_source(),
                &config.queue.buffer_source(),
                config.queue.capacity,
                open_mode,
            )?;
            state = state.with_queue(Arc::new(queue));
        }

        if mode == ServerMode::Streaming {
            let frames = if config.shm.is_shared() {
                FrameBuffer::attach(&config.shm.info_source(), &config.shm.image_sources())?
            } else {
                let size = config.stream.in_process_resolution();
                info!("No shared frame buffer configured, streaming a {} in-process buffer", size);
                FrameBuffer::in_process(1, size, size)?
            };

            let video = VideoSource::new(
                frames.clone(),
                config.stream.fps,
                config.webrtc.bitrate_kbps,
                config.stream.broadcast,
                state.shutdown.clone(),
            );
            state = state.with_video(Arc::new(video));

            if config.stream.mjpeg_enabled {
                let handler = Arc::new(MjpegStreamHandler::new());
                state.spawn_mjpeg_producer(&frames, handler.clone())?;
                state = state.with_mjpeg(handler);
            }
            state.frames = Some(frames);
        }

        Ok(state)
    }

    pub fn with_queue(mut self, queue: Arc<CircularQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_video(mut self, video: Arc<VideoSource>) -> Self {
        self.video = Some(video);
        self
    }

    pub fn with_mjpeg(mut self, mjpeg: Arc<MjpegStreamHandler>) -> Self {
        self.mjpeg = Some(mjpeg);
        self
    }

    fn spawn_mjpeg_producer(&self, frames: &FrameBuffer, handler: Arc<MjpegStreamHandler>) -> Result<()> {
        let stream = &self.config.stream;
        let initial = frames
            .active()
            .map(|(_, resolution)| resolution)
            .unwrap_or(stream.in_process_resolution());
        let encoder = JpegEncoder::with_quality(initial, stream.jpeg_quality)?;
        let adapter = MediaTrackAdapter::new(frames.clone(), stream.fps);
        let sink = MjpegSink::new(handler);
        let cancel = self.shutdown.token();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = run_pump("mjpeg", adapter, Box::new(encoder), sink, cancel, shutdown).await {
                error!("MJPEG producer stopped: {}", e);
            }
        });
        Ok(())
    }

    /// Close peers and sockets, then end MJPEG streams
    pub async fn close_connections(&self) -> ShutdownReport {
        let report = shutdown_connections(&self.peers, &self.sockets).await;
        if let Some(mjpeg) = &self.mjpeg {
            mjpeg.set_offline();
        }
        report
    }

    /// Release the queue and frame buffer regions. Call after the server stopped.
    pub fn release_regions(&self) {
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.cleanup() {
                warn!("Failed to release event queue: {}", e);
            }
        }
        if let Some(frames) = &self.frames {
            if let Err(e) = frames.release() {
                warn!("Failed to release frame buffer: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_interaction_mode() {
        let state = AppState::build(ServerMode::Interaction, AppConfig::default(), ShutdownHandle::new()).unwrap();
        assert!(state.queue.is_some());
        assert!(state.video.is_none());
        assert!(state.frames.is_none());
        assert_eq!(state.queue.as_ref().unwrap().capacity(), 200);
    }

    #[tokio::test]
    async fn test_build_streaming_in_process() {
        let mut config = AppConfig::default();
        config.stream.mjpeg_enabled = true;
        config.queue.enabled = false;
        let shutdown = ShutdownHandle::new();

        let state = AppState::build(ServerMode::Streaming, config, shutdown.clone()).unwrap();
        assert!(state.queue.is_none());
        assert!(state.video.as_ref().unwrap().is_broadcast());
        assert!(state.mjpeg.is_some());

        let report = state.close_connections().await;
        assert_eq!(report.peers_closed, 0);
        assert!(!state.mjpeg.as_ref().unwrap().is_online());
        shutdown.trigger();
        state.release_regions();
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let state = AppState::build(ServerMode::Interaction, AppConfig::default(), ShutdownHandle::new()).unwrap();
        let queue = state.queue.clone().unwrap();
        state.release_regions();
        state.release_regions();
        assert!(!queue.enqueue(&crate::queue::EventRecord::wheel(1.0, 0.0)));
    }
}
