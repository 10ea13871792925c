//! MJPEG stream handler
//!
//! Holds the latest JPEG and wakes HTTP clients when it changes. A single
//! producer pump feeds it, and only while at least one client is connected.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use tracing::info;

use crate::error::Result;
use crate::video::encoder::EncodedFrame;
use crate::video::format::Resolution;
use crate::video::pump::FrameSink;

/// Multipart boundary of the MJPEG response
pub const MJPEG_BOUNDARY: &str = "image-boundary";

/// Client ID type (UUID string)
pub type ClientId = String;

/// One JPEG image with its sequence number
#[derive(Debug, Clone)]
pub struct JpegFrame {
    pub data: Bytes,
    pub resolution: Resolution,
    pub sequence: u64,
}

impl JpegFrame {
    /// SOI at the start and EOI at the end
    pub fn is_valid_jpeg(&self) -> bool {
        let len = self.data.len();
        len >= 4 && self.data[..2] == [0xFF, 0xD8] && self.data[len - 2..] == [0xFF, 0xD9]
    }
}

#[derive(Debug, Clone)]
struct ClientSession {
    connected_at: Instant,
    frames_sent: u64,
}

/// MJPEG stream handler
/// Manages video frame distribution to HTTP clients
pub struct MjpegStreamHandler {
    /// Current frame (latest) - using ArcSwap for lock-free reads
    current_frame: ArcSwap<Option<JpegFrame>>,
    /// Frame update notification
    frame_notify: broadcast::Sender<()>,
    online: AtomicBool,
    sequence: AtomicU64,
    clients: RwLock<HashMap<ClientId, ClientSession>>,
    /// Wakes the producer when the first client arrives
    client_joined: Notify,
}

impl MjpegStreamHandler {
    pub fn new() -> Self {
        let (frame_notify, _) = broadcast::channel(16);
        Self {
            current_frame: ArcSwap::from_pointee(None),
            frame_notify,
            online: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            client_joined: Notify::new(),
        }
    }

    /// Publish a freshly encoded JPEG
    pub fn update_frame(&self, data: Bytes, resolution: Resolution) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.current_frame.store(Arc::new(Some(JpegFrame {
            data,
            resolution,
            sequence,
        })));
        let _ = self.frame_notify.send(());
    }

    /// Get current frame (if any)
    pub fn current_frame(&self) -> Option<JpegFrame> {
        (**self.current_frame.load()).clone()
    }

    /// Subscribe to frame updates
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.frame_notify.subscribe()
    }

    /// End every stream; used at shutdown
    pub fn set_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        let _ = self.frame_notify.send(());
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn register_client(&self, client_id: ClientId) {
        let count = {
            let mut clients = self.clients.write();
            clients.insert(
                client_id.clone(),
                ClientSession {
                    connected_at: Instant::now(),
                    frames_sent: 0,
                },
            );
            clients.len()
        };
        info!("MJPEG client {} connected (total: {})", client_id, count);
        self.client_joined.notify_one();
    }

    fn unregister_client(&self, client_id: &str) {
        if let Some(session) = self.clients.write().remove(client_id) {
            let secs = session.connected_at.elapsed().as_secs_f32();
            let avg_fps = if secs > 0.1 {
                session.frames_sent as f32 / secs
            } else {
                0.0
            };
            info!(
                "MJPEG client {} disconnected after {:.1}s ({} frames, {:.1} avg FPS)",
                client_id, secs, session.frames_sent, avg_fps
            );
        }
    }

    /// Record frame sent to a specific client
    pub fn record_frame_sent(&self, client_id: &str) {
        if let Some(session) = self.clients.write().get_mut(client_id) {
            session.frames_sent += 1;
        }
    }

    /// Resolve once at least one client is connected
    pub async fn wait_for_clients(&self) {
        loop {
            let notified = self.client_joined.notified();
            if self.client_count() > 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for MjpegStreamHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for client lifecycle management
/// Ensures cleanup even on abrupt disconnection
pub struct ClientGuard {
    client_id: ClientId,
    handler: Arc<MjpegStreamHandler>,
}

impl ClientGuard {
    pub fn new(client_id: ClientId, handler: Arc<MjpegStreamHandler>) -> Self {
        handler.register_client(client_id.clone());
        Self { client_id, handler }
    }

    pub fn id(&self) -> &ClientId {
        &self.client_id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.handler.unregister_client(&self.client_id);
    }
}

/// Pump sink publishing into the handler
pub struct MjpegSink {
    handler: Arc<MjpegStreamHandler>,
}

impl MjpegSink {
    pub fn new(handler: Arc<MjpegStreamHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl FrameSink for MjpegSink {
    async fn ready(&mut self) {
        self.handler.wait_for_clients().await
    }

    async fn deliver(&mut self, frame: EncodedFrame) -> Result<()> {
        self.handler.update_frame(frame.data, frame.resolution);
        Ok(())
    }
}

/// Create MJPEG multipart frame bytes
pub fn create_mjpeg_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());

    buf.put_slice(b"--");
    buf.put_slice(MJPEG_BOUNDARY.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");

    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn jpeg() -> Bytes {
        Bytes::from_static(&[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9])
    }

    #[tokio::test]
    async fn test_update_notifies_subscribers() {
        let handler = MjpegStreamHandler::new();
        let mut rx = handler.subscribe();
        assert!(handler.current_frame().is_none());

        handler.update_frame(jpeg(), Resolution::VGA);
        rx.recv().await.unwrap();
        let frame = handler.current_frame().unwrap();
        assert_eq!(frame.sequence, 1);
        assert!(frame.is_valid_jpeg());
    }

    #[tokio::test]
    async fn test_client_guard_wakes_producer() {
        let handler = Arc::new(MjpegStreamHandler::new());
        let waiter = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.wait_for_clients().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let guard = ClientGuard::new("c1".into(), handler.clone());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handler.client_count(), 1);
        drop(guard);
        assert_eq!(handler.client_count(), 0);
    }

    #[test]
    fn test_part_framing() {
        let part = create_mjpeg_part(&jpeg());
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--image-boundary\r\nContent-Type: image/jpeg\r\nContent-Length: 6\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }
}
