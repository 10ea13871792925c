//! WebRTC peer connection
//!
//! One connection per `/offer`. The server sends a single H.264 track and
//! answers only after ICE gathering completes (no trickle ICE).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::peer_set::{MediaSession, PeerConnectionSet};
use super::signaling::{ConnectionState, SessionDescription};
use super::source::TrackLease;
use crate::error::{AppError, Result};

/// Peer connection wrapper
pub struct PeerConnection {
    id: String,
    pc: Arc<RTCPeerConnection>,
    lease: Mutex<Option<TrackLease>>,
    state_rx: watch::Receiver<ConnectionState>,
}

fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut servers: Vec<RTCIceServer> = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    servers.extend(config.turn_servers.iter().map(|turn| RTCIceServer {
        urls: turn.urls.clone(),
        username: turn.username.clone(),
        credential: turn.credential.clone(),
        ..Default::default()
    }));
    servers
}

impl PeerConnection {
    /// Create a peer connection.
    ///
    /// The connection watches its own state and, on failure, removes itself
    /// from `peers` and closes. `peers` is held weakly.
    pub async fn new(config: &WebRtcConfig, id: String, peers: Weak<PeerConnectionSet>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let session_id = id.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            let session_id = session_id.clone();
            let peers = peers.clone();

            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };

                info!("Peer {} connection state: {}", session_id, new_state);
                let _ = state_tx.send(new_state);

                if new_state == ConnectionState::Failed {
                    // Closing from inside the callback would wait on ourselves
                    tokio::spawn(async move {
                        if let Some(peers) = peers.upgrade() {
                            peers.close_and_remove(&session_id).await;
                        }
                    });
                }
            })
        }));

        Ok(Self {
            id,
            pc,
            lease: Mutex::new(None),
            state_rx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Apply a remote offer, attach the video track and produce the answer.
    pub async fn handle_offer(
        &self,
        offer: SessionDescription,
        lease: TrackLease,
        gathering_timeout: Duration,
    ) -> Result<SessionDescription> {
        offer.validate_offer()?;
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| AppError::BadRequest(format!("Invalid SDP offer: {}", e)))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to set remote description: {}", e)))?;

        let track = lease.track();
        let demand = lease.demand();
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;
        *self.lease.lock() = Some(lease);

        // Drain RTCP so interceptors run; a loss report asks for a key frame
        let session_id = self.id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((packets, _)) = sender.read(&mut buf).await {
                let wants_keyframe = packets.iter().any(|p| {
                    let any = p.as_any();
                    any.is::<PictureLossIndication>() || any.is::<FullIntraRequest>()
                });
                if wants_keyframe {
                    debug!("Peer {} requested a key frame", session_id);
                    demand.request_keyframe();
                }
            }
            debug!("Peer {} RTCP reader stopped", session_id);
        });

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "Peer {}: ICE gathering not complete after {:?}, answering with current candidates",
                self.id, gathering_timeout
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("No local description".to_string()))?;

        debug!("Peer {} answer ready ({} bytes)", self.id, local.sdp.len());
        Ok(SessionDescription {
            sdp: local.sdp,
            sdp_type: local.sdp_type.to_string(),
        })
    }
}

#[async_trait]
impl MediaSession for PeerConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) -> Result<()> {
        // Releasing the lease stops a dedicated pump
        drop(self.lease.lock().take());
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::config::TurnServer;

    #[test]
    fn test_ice_servers_from_config() {
        let config = WebRtcConfig {
            stun_servers: vec!["stun:stun.example.com:3478".into()],
            turn_servers: vec![TurnServer {
                urls: vec!["turn:turn.example.com:3478".into()],
                username: "u".into(),
                credential: "p".into(),
            }],
            ..Default::default()
        };
        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "u");
    }

    #[tokio::test]
    async fn test_new_connection_starts_in_new_state() {
        let peers = Arc::new(PeerConnectionSet::new());
        let peer = PeerConnection::new(&WebRtcConfig::default(), "p1".into(), Arc::downgrade(&peers))
            .await
            .unwrap();
        assert_eq!(peer.state(), ConnectionState::New);
        assert_eq!(peer.id(), "p1");
        assert!(peer.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_non_offer() {
        let peers = Arc::new(PeerConnectionSet::new());
        let peer = PeerConnection::new(&WebRtcConfig::default(), "p2".into(), Arc::downgrade(&peers))
            .await
            .unwrap();
        let res = crate::video::format::Resolution::new(16, 16);
        let frames = crate::video::frame_buffer::FrameBuffer::in_process(1, res, res).unwrap();
        let shutdown = crate::lifecycle::ShutdownHandle::new();
        let source = super::super::source::VideoSource::new(frames, 30, 500, true, shutdown.clone());

        let result = peer
            .handle_offer(
                SessionDescription::answer("v=0"),
                source.subscribe("p2"),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        peer.close().await.unwrap();
        shutdown.trigger();
    }
}
