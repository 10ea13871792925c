//! Set of negotiated media sessions
//!
//! Removal is the single point of ownership transfer: whoever takes a session
//! out of the set is the one that closes it. The failure observer and the
//! shutdown path race on removal, never on close, so no session is closed
//! twice.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;

/// A closable media session
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn id(&self) -> &str;

    async fn close(&self) -> Result<()>;
}

/// Outcome of closing every session
#[derive(Debug, Default)]
pub struct CloseReport {
    pub closed: usize,
    pub failed: Vec<(String, String)>,
}

impl CloseReport {
    pub fn total(&self) -> usize {
        self.closed + self.failed.len()
    }
}

#[derive(Default)]
pub struct PeerConnectionSet {
    sessions: Mutex<HashMap<String, Arc<dyn MediaSession>>>,
    /// Set under the `sessions` lock by `close_all`
    closing: AtomicBool,
}

impl PeerConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns `false`, leaving the session with the
    /// caller, once `close_all` has started.
    pub fn insert(&self, session: Arc<dyn MediaSession>) -> bool {
        let id = session.id().to_string();
        let count = {
            let mut sessions = self.sessions.lock();
            if self.closing.load(Ordering::SeqCst) {
                debug!("Peer {} rejected, set is closing", id);
                return false;
            }
            sessions.insert(id.clone(), session);
            sessions.len()
        };
        info!("Peer {} registered (total: {})", id, count);
        true
    }

    /// Take a session out of the set. The caller now owns closing it.
    pub fn remove(&self, id: &str) -> Option<Arc<dyn MediaSession>> {
        self.sessions.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Remove and close one session.
    ///
    /// Returns `false` when the session was already gone, in which case
    /// someone else has closed or is closing it.
    pub async fn close_and_remove(&self, id: &str) -> bool {
        let Some(session) = self.remove(id) else {
            debug!("Peer {} already removed", id);
            return false;
        };
        if let Err(e) = session.close().await {
            warn!("Failed to close peer {}: {}", id, e);
        }
        info!("Peer {} closed (remaining: {})", id, self.len());
        true
    }

    /// Close every session concurrently and leave the set empty.
    ///
    /// Later inserts are refused. A failing close is recorded and does not
    /// stop the others.
    pub async fn close_all(&self) -> CloseReport {
        let drained: Vec<_> = {
            let mut sessions = self.sessions.lock();
            self.closing.store(true, Ordering::SeqCst);
            sessions.drain().map(|(_, s)| s).collect()
        };
        if drained.is_empty() {
            return CloseReport::default();
        }
        info!("Closing {} peer connection(s)", drained.len());

        let results = join_all(drained.iter().map(|session| async move {
            (session.id().to_string(), session.close().await)
        }))
        .await;

        let mut report = CloseReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    warn!("Failed to close peer {}: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Session that counts how often it was closed
    pub(crate) struct CountingSession {
        pub id: String,
        pub closes: AtomicUsize,
        pub fail: bool,
    }

    impl CountingSession {
        pub fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                closes: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl MediaSession for CountingSession {
        fn id(&self) -> &str {
            &self.id
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                Err(AppError::WebRtcError("transport already gone".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_close_all_closes_each_once() {
        let set = PeerConnectionSet::new();
        let sessions: Vec<_> = (0..4)
            .map(|i| CountingSession::new(&format!("p{}", i), i == 2))
            .collect();
        for s in &sessions {
            set.insert(s.clone());
        }

        let report = set.close_all().await;
        assert_eq!(report.closed, 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "p2");
        assert!(set.is_empty());
        for s in &sessions {
            assert_eq!(s.closes.load(Ordering::SeqCst), 1);
        }

        // A second pass finds nothing to close
        assert_eq!(set.close_all().await.total(), 0);
    }

    #[tokio::test]
    async fn test_failure_path_and_shutdown_do_not_double_close() {
        let set = PeerConnectionSet::new();
        let session = CountingSession::new("p", false);
        set.insert(session.clone());

        assert!(set.close_and_remove("p").await);
        assert!(!set.close_and_remove("p").await);
        set.close_all().await;
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_insert_after_close_all_is_refused() {
        let set = PeerConnectionSet::new();
        assert_eq!(set.close_all().await.total(), 0);

        let late = CountingSession::new("late", false);
        assert!(!set.insert(late.clone()));
        assert!(set.is_empty());
        assert!(!set.close_and_remove("late").await);
        assert_eq!(late.closes.load(Ordering::SeqCst), 0);
    }
}
