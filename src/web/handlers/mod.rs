use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::mjpeg::{create_mjpeg_part, ClientGuard, MJPEG_BOUNDARY};
use crate::webrtc::{MediaSession, PeerConnection, SessionDescription};

// ============================================================================
// Health & Status
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub len: usize,
    pub capacity: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub peers: usize,
    pub websockets: usize,
    pub queue: Option<QueueStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mjpeg_clients: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_viewers: Option<usize>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        peers: state.peers.len(),
        websockets: state.sockets.len(),
        queue: state.queue.as_ref().map(|q| QueueStatus {
            len: q.len(),
            capacity: q.capacity(),
        }),
        mjpeg_clients: state.mjpeg.as_ref().map(|m| m.client_count()),
        broadcast_viewers: state.video.as_ref().and_then(|v| v.shared_viewers()),
    })
}

// ============================================================================
// WebRTC
// ============================================================================

/// Answer an SDP offer with a new peer connection
///
/// The peer is registered before negotiation so shutdown can reach it at
/// any point; a failed negotiation removes and closes it again.
pub async fn offer(
    State(state): State<Arc<AppState>>,
    Json(offer): Json<SessionDescription>,
) -> Result<Json<SessionDescription>> {
    let video = state
        .video
        .clone()
        .ok_or_else(|| AppError::ServiceUnavailable("video is not available".to_string()))?;
    if state.shutdown.is_triggered() {
        return Err(AppError::ServiceUnavailable("server is shutting down".to_string()));
    }
    offer.validate_offer()?;

    let peer_id = uuid::Uuid::new_v4().to_string();
    let webrtc_config = &state.config.webrtc;
    let peer = Arc::new(
        PeerConnection::new(webrtc_config, peer_id.clone(), Arc::downgrade(&state.peers)).await?,
    );
    if !state.peers.insert(peer.clone()) {
        // Shutdown drained the set while the connection was being built
        if let Err(e) = peer.close().await {
            debug!("Failed to close rejected peer {}: {}", peer_id, e);
        }
        return Err(AppError::ServiceUnavailable("server is shutting down".to_string()));
    }

    let lease = video.subscribe(&peer_id);
    let gathering_timeout = Duration::from_millis(webrtc_config.gathering_timeout_ms);
    match peer.handle_offer(offer, lease, gathering_timeout).await {
        Ok(answer) => {
            info!("Peer {} negotiated", peer_id);
            Ok(Json(answer))
        }
        Err(e) => {
            state.peers.close_and_remove(&peer_id).await;
            Err(e)
        }
    }
}

// ============================================================================
// MJPEG
// ============================================================================

/// Multipart JPEG stream
///
/// The stream ends when the client goes away, when a part cannot be
/// written, or when the handler goes offline at shutdown.
pub async fn mjpeg_stream(State(state): State<Arc<AppState>>) -> Response {
    let Some(handler) = state.mjpeg.clone() else {
        return AppError::ServiceUnavailable("MJPEG is not enabled".to_string()).into_response();
    };

    let client_id = uuid::Uuid::new_v4().to_string();
    let guard = Arc::new(ClientGuard::new(client_id, handler.clone()));

    // Capacity 1: the feeder only advances once hyper took the previous part
    let (tx, mut rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(1);

    let feeder_guard = guard.clone();
    let feeder_handler = handler.clone();
    tokio::spawn(async move {
        let mut notify_rx = feeder_handler.subscribe();
        let mut last_seq = 0u64;

        if let Some(frame) = feeder_handler.current_frame() {
            if frame.is_valid_jpeg() {
                if tx.send(create_mjpeg_part(&frame.data)).await.is_err() {
                    return;
                }
                last_seq = frame.sequence;
            }
        }

        loop {
            match notify_rx.recv().await {
                Ok(()) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if !feeder_handler.is_online() {
                        break;
                    }
                    let Some(frame) = feeder_handler.current_frame() else {
                        continue;
                    };
                    if frame.sequence == last_seq || !frame.is_valid_jpeg() {
                        continue;
                    }
                    if tx.send(create_mjpeg_part(&frame.data)).await.is_err() {
                        break;
                    }
                    last_seq = frame.sequence;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("MJPEG feeder for {} stopped", feeder_guard.id());
    });

    let stream_handler = handler.clone();
    let body_stream = async_stream::stream! {
        while let Some(data) = rx.recv().await {
            yield Ok::<bytes::Bytes, std::io::Error>(data);
            stream_handler.record_frame_sent(guard.id());
        }
    };

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
            ),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
        ],
        Body::from_stream(body_stream),
    )
        .into_response()
}
