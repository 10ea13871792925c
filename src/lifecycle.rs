//! Shutdown coordination
//!
//! Order matters: media sessions are closed first, then sockets are told to
//! go away, and only after the server has stopped are the shared regions
//! released (see `main`).

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::web::registry::{WsRegistry, CLOSE_GOING_AWAY};
use crate::webrtc::peer_set::PeerConnectionSet;

/// Reason sent with the going-away close frame
pub const SHUTDOWN_REASON: &str = "Server shutdown";

/// How long to wait for sockets to flush their close frames
const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Process-wide shutdown trigger
///
/// Cloned into every long-running task. A fatal error records its message and
/// triggers shutdown; `main` turns that into a non-zero exit.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
    fatal: Arc<Mutex<Option<String>>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled on shutdown or when cancelled itself
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
            self.token.cancel();
        }
    }

    /// Record a fatal error and start shutdown. The first error wins.
    pub fn fail(&self, err: &AppError) {
        error!("Fatal error, shutting down: {}", err);
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(err.to_string());
            }
        }
        self.token.cancel();
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}

/// What shutdown did
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub peers_closed: usize,
    pub peer_failures: usize,
    pub sockets_notified: usize,
}

/// Close all peer sessions (awaited together) and then every socket.
///
/// Always completes; individual failures are logged and counted.
pub async fn shutdown_connections(peers: &PeerConnectionSet, sockets: &WsRegistry) -> ShutdownReport {
    let peer_report = peers.close_all().await;
    if !peer_report.failed.is_empty() {
        warn!("{} peer connection(s) failed to close cleanly", peer_report.failed.len());
    }

    let sockets_notified = sockets
        .close_all(CLOSE_GOING_AWAY, SHUTDOWN_REASON, SOCKET_CLOSE_TIMEOUT)
        .await;

    let report = ShutdownReport {
        peers_closed: peer_report.closed,
        peer_failures: peer_report.failed.len(),
        sockets_notified,
    };
    info!(
        "Connections closed: {} peer(s), {} failed, {} socket(s)",
        report.peers_closed, report.peer_failures, report.sockets_notified
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::peer_set::tests::CountingSession;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_shutdown_closes_peers_then_sockets() {
        let peers = PeerConnectionSet::new();
        let sessions: Vec<_> = (0..3)
            .map(|i| CountingSession::new(&format!("peer-{}", i), i == 1))
            .collect();
        for s in &sessions {
            peers.insert(s.clone());
        }

        let sockets = WsRegistry::new();
        let mut clients = Vec::new();
        for _ in 0..2 {
            let (guard, mut rx) = sockets.register();
            let session_list = sessions.clone();
            clients.push(tokio::spawn(async move {
                let notice = rx.recv().await.unwrap();
                // Every peer must already be closed when sockets are told to go
                let peers_closed = session_list
                    .iter()
                    .all(|s| s.closes.load(Ordering::SeqCst) == 1);
                if let Some(done) = notice.done {
                    let _ = done.send(());
                }
                drop(guard);
                (notice.code, peers_closed)
            }));
        }

        let report = shutdown_connections(&peers, &sockets).await;
        assert_eq!(report.peers_closed, 2);
        assert_eq!(report.peer_failures, 1);
        assert_eq!(report.sockets_notified, 2);
        assert!(peers.is_empty());

        for client in clients {
            let (code, peers_closed) = client.await.unwrap();
            assert_eq!(code, 1001);
            assert!(peers_closed);
        }
        for s in &sessions {
            assert_eq!(s.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_first_fatal_error_wins() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_triggered());
        handle.fail(&AppError::InvalidGeometry("0x0".into()));
        handle.fail(&AppError::VideoError("later".into()));
        assert!(handle.is_triggered());
        assert!(handle.fatal_error().unwrap().contains("0x0"));
    }

    #[test]
    fn test_child_token_follows_shutdown() {
        let handle = ShutdownHandle::new();
        let child = handle.child_token();
        handle.trigger();
        assert!(child.is_cancelled());
    }
}
