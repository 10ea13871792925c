//! Registry of open input WebSockets
//!
//! Entries are weak: the registry only exists so that shutdown can reach
//! every socket, and it never keeps one alive. Each session owns a strong
//! [`WsGuard`]; dropping it unregisters the socket however the session ended.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Close code for a normal, client-requested close
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for "going away"
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Client ID type
pub type ClientId = String;

/// Request for a session to close its socket
#[derive(Debug)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: String,
    /// Signalled once the close frame was written (or the write failed)
    pub done: Option<oneshot::Sender<()>>,
}

/// Per-socket state shared by the session and the registry
#[derive(Debug)]
pub struct WsClient {
    pub id: ClientId,
    pub connected_at: Instant,
    pub events_processed: AtomicU64,
    close_tx: mpsc::Sender<CloseNotice>,
}

impl WsClient {
    pub fn events_count(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn connected_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }
}

#[derive(Debug, Default)]
pub struct WsRegistry {
    clients: RwLock<HashMap<ClientId, Weak<WsClient>>>,
    /// Set by `close_all`; sockets registering afterwards are closed at once
    closing: RwLock<Option<(u16, String)>>,
}

/// Keeps a socket registered for as long as it lives
pub struct WsGuard {
    client: Arc<WsClient>,
    registry: Arc<WsRegistry>,
}

impl WsGuard {
    pub fn client(&self) -> &Arc<WsClient> {
        &self.client
    }
}

impl Drop for WsGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.client);
    }
}

impl WsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new socket; the receiver yields the shutdown close request.
    ///
    /// After `close_all` the receiver already holds a close notice.
    pub fn register(self: &Arc<Self>) -> (WsGuard, mpsc::Receiver<CloseNotice>) {
        let (close_tx, close_rx) = mpsc::channel(1);
        let client = Arc::new(WsClient {
            id: uuid::Uuid::new_v4().to_string(),
            connected_at: Instant::now(),
            events_processed: AtomicU64::new(0),
            close_tx,
        });
        {
            let mut clients = self.clients.write();
            if let Some((code, reason)) = self.closing.read().clone() {
                debug!("WebSocket {} registered during shutdown, closing", client.id);
                let _ = client.close_tx.try_send(CloseNotice {
                    code,
                    reason,
                    done: None,
                });
            }
            clients.insert(client.id.clone(), Arc::downgrade(&client));
        }
        info!("WebSocket {} connected (total: {})", client.id, self.len());
        (
            WsGuard {
                client,
                registry: self.clone(),
            },
            close_rx,
        )
    }

    fn unregister(&self, client: &WsClient) {
        if self.clients.write().remove(&client.id).is_some() {
            info!(
                "WebSocket {} disconnected after {}s ({} events)",
                client.id,
                client.connected_secs(),
                client.events_count()
            );
        }
    }

    /// Live sockets
    pub fn len(&self) -> usize {
        self.clients
            .read()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every live socket to close and wait (bounded by `timeout`) for the
    /// close frames to go out. Returns the number of sockets notified.
    pub async fn close_all(&self, code: u16, reason: &str, timeout: Duration) -> usize {
        let live: Vec<Arc<WsClient>> = {
            let clients = self.clients.write();
            *self.closing.write() = Some((code, reason.to_string()));
            clients.values().filter_map(Weak::upgrade).collect()
        };
        if live.is_empty() {
            return 0;
        }
        info!("Closing {} WebSocket(s) with code {}", live.len(), code);

        let mut pending = Vec::with_capacity(live.len());
        for client in &live {
            let (done_tx, done_rx) = oneshot::channel();
            let notice = CloseNotice {
                code,
                reason: reason.to_string(),
                done: Some(done_tx),
            };
            if client.close_tx.try_send(notice).is_ok() {
                pending.push(done_rx);
            } else {
                debug!("WebSocket {} already closing", client.id);
            }
        }
        let notified = pending.len();
        drop(live);

        let waited = tokio::time::timeout(timeout, futures::future::join_all(pending)).await;
        if waited.is_err() {
            debug!("Timed out waiting for WebSocket close frames");
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_drop_unregisters() {
        let registry = WsRegistry::new();
        let (guard, _rx) = registry.register();
        let (_other, _rx2) = registry.register();
        assert_eq!(registry.len(), 2);
        drop(guard);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_reaches_every_socket() {
        let registry = WsRegistry::new();
        let mut sessions = Vec::new();
        for _ in 0..3 {
            let (guard, mut rx) = registry.register();
            sessions.push(tokio::spawn(async move {
                let notice = rx.recv().await.unwrap();
                if let Some(done) = notice.done {
                    let _ = done.send(());
                }
                drop(guard);
                (notice.code, notice.reason)
            }));
        }

        let notified = registry
            .close_all(CLOSE_GOING_AWAY, "Server shutdown", Duration::from_secs(1))
            .await;
        assert_eq!(notified, 3);
        for session in sessions {
            let (code, reason) = session.await.unwrap();
            assert_eq!(code, 1001);
            assert_eq!(reason, "Server shutdown");
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_after_close_all_is_closed_immediately() {
        let registry = WsRegistry::new();
        assert_eq!(
            registry
                .close_all(CLOSE_GOING_AWAY, "Server shutdown", Duration::from_millis(10))
                .await,
            0
        );

        let (_guard, mut rx) = registry.register();
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.code, CLOSE_GOING_AWAY);
        assert_eq!(notice.reason, "Server shutdown");
        assert!(notice.done.is_none());
    }

    #[tokio::test]
    async fn test_registry_does_not_keep_sockets_alive() {
        let registry = WsRegistry::new();
        let (guard, rx) = registry.register();
        let weak = Arc::downgrade(guard.client());
        drop(guard);
        drop(rx);
        assert!(weak.upgrade().is_none());
        assert_eq!(
            registry
                .close_all(CLOSE_GOING_AWAY, "Server shutdown", Duration::from_millis(10))
                .await,
            0
        );
    }
}
