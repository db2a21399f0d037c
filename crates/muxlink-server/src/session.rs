//! Parent session pool and per-flow stream acquisition.
//!
//! Sessions are created lazily, one slot at a time: a single-flight gate
//! covers the resolve-or-create sequence across *all* slots, so concurrent
//! callers that cannot take the gate immediately fail fast with
//! [`RelayError::Busy`] and retry. Opening a stream on an already-resolved
//! session happens outside the gate and relies on the mux session's own
//! thread safety.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_yamux::session::SessionType;
use tokio_yamux::stream::StreamHandle;
use tokio_yamux::{Config as YamuxConfig, Control, Session};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::transport::{Connector, ParentStream};

/// One multiplexed session to the parent.
///
/// Cheap to clone; all clones share the underlying session. The driver task
/// spawned at creation services the session until it dies and then raises the
/// closed flag the watcher polls.
#[derive(Clone)]
pub struct MuxSession {
    control: Control,
    closed: Arc<AtomicBool>,
}

impl MuxSession {
    /// Wrap a freshly dialed parent connection as a client-role session.
    fn client(conn: ParentStream) -> Self {
        let mut session = Session::new(conn, YamuxConfig::default(), SessionType::Client);
        let control = session.control();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        tokio::spawn(async move {
            // The parent never opens streams toward us; the driver only keeps
            // the session serviced.
            while let Some(res) = session.next().await {
                if let Err(e) = res {
                    debug!(error = %e, "session terminated");
                    break;
                }
            }
            flag.store(true, Ordering::SeqCst);
        });
        Self { control, closed }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn open_stream(&self) -> Result<StreamHandle, RelayError> {
        let mut control = self.control.clone();
        control
            .open_stream()
            .await
            .map_err(|e| RelayError::Mux(e.to_string()))
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut control = self.control.clone();
        let _ = control.close().await;
    }
}

/// Pool of session slots to one parent, shared by every flow of a relay
/// instance.
pub struct SessionPool {
    connector: Connector,
    parent: String,
    key: String,
    server_id: String,
    /// Destination announced in each flow-open header (`tcp:`/`udp:` prefixed).
    dest: String,
    timeout: Duration,
    session_count: usize,
    watch_interval: Duration,
    sessions: DashMap<usize, MuxSession>,
    gate: Semaphore,
    shutdown: CancellationToken,
}

impl SessionPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Connector,
        parent: String,
        key: String,
        server_id: String,
        dest: String,
        timeout: Duration,
        session_count: usize,
        watch_interval: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            parent,
            key,
            server_id,
            dest,
            timeout,
            session_count,
            watch_interval,
            sessions: DashMap::new(),
            gate: Semaphore::new(1),
            shutdown,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquire a stream on a randomly chosen slot and announce the flow.
    ///
    /// Returns the stream with its flow-open header already written, plus the
    /// minted flow identifier.
    pub async fn acquire_flow(self: &Arc<Self>) -> Result<(StreamHandle, String), RelayError> {
        let index = if self.session_count > 1 {
            rand::thread_rng().gen_range(0..self.session_count)
        } else {
            0
        };
        let mut stream = self.acquire_stream(index).await?;

        let flow_id = Uuid::new_v4().simple().to_string();
        let header = muxlink_proto::build_flow_open(&flow_id, &self.dest, &self.server_id)?;
        match timeout(self.timeout, stream.write_all(&header)).await {
            Ok(Ok(())) => Ok((stream, flow_id)),
            Ok(Err(e)) => {
                self.evict(index).await;
                Err(e.into())
            }
            Err(_) => {
                self.evict(index).await;
                Err(RelayError::HandshakeTimeout)
            }
        }
    }

    /// Resolve or create the session for `index`, then open a stream on it.
    pub async fn acquire_stream(
        self: &Arc<Self>,
        index: usize,
    ) -> Result<StreamHandle, RelayError> {
        let session = self.session_for(index).await?;
        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                // A failed open is fatal to the session.
                session.close().await;
                self.sessions.remove(&index);
                Err(e)
            }
        }
    }

    async fn session_for(self: &Arc<Self>, index: usize) -> Result<MuxSession, RelayError> {
        let _permit = self.gate.try_acquire().map_err(|_| RelayError::Busy)?;
        if let Some(existing) = self.sessions.get(&index) {
            return Ok(existing.clone());
        }
        self.create_session(index).await
    }

    async fn create_session(self: &Arc<Self>, index: usize) -> Result<MuxSession, RelayError> {
        let mut conn = self.connector.connect(&self.parent, self.timeout).await?;

        let header = muxlink_proto::build_identify(&self.key, &self.server_id)?;
        match timeout(self.timeout, conn.write_all(&header)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(RelayError::HandshakeTimeout),
        }

        let session = MuxSession::client(conn);
        // Last writer wins; a racer's stale entry is closed, not leaked.
        if let Some(stale) = self.sessions.insert(index, session.clone()) {
            stale.close().await;
        }
        info!(slot = index, "session created");
        self.spawn_watcher(index, session.clone());
        Ok(session)
    }

    /// Poll the session's liveness until it reports closed, then evict its
    /// slot so the next acquire dials fresh.
    fn spawn_watcher(self: &Arc<Self>, index: usize, session: MuxSession) {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                if session.is_closed() {
                    pool.sessions.remove(&index);
                    debug!(slot = index, "session closed, slot evicted");
                    return;
                }
                tokio::select! {
                    biased;
                    _ = pool.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(pool.watch_interval) => {}
                }
            }
        });
    }

    async fn evict(&self, index: usize) {
        if let Some((_, session)) = self.sessions.remove(&index) {
            session.close().await;
        }
    }

    /// Close every live session. Used on shutdown.
    pub async fn close_all(&self) {
        let slots: Vec<usize> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for slot in slots {
            if let Some((_, session)) = self.sessions.remove(&slot) {
                session.close().await;
            }
        }
    }

    #[cfg(test)]
    fn live_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxlink_proto::Header;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    /// Minimal parent: accepts connections, records identify headers, and
    /// services a server-role yamux session per connection.
    async fn spawn_stub_parent() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let identities = Arc::new(AtomicUsize::new(0));
        let counter = identities.clone();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let header = muxlink_proto::read_header(&mut conn).await.unwrap();
                assert!(matches!(header, Header::Identify { .. }));
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut session =
                        Session::new(conn, YamuxConfig::default(), SessionType::Server);
                    while let Some(res) = session.next().await {
                        if res.is_err() {
                            break;
                        }
                        // Streams are accepted and dropped; these tests only
                        // exercise acquisition.
                    }
                });
            }
        });
        (addr, identities)
    }

    fn test_pool(parent: std::net::SocketAddr, watch_interval: Duration) -> Arc<SessionPool> {
        SessionPool::new(
            Connector::Tcp { jumper: None },
            parent.to_string(),
            "test-key".into(),
            "srv-test".into(),
            "tcp:127.0.0.9:9".into(),
            Duration::from_secs(2),
            1,
            watch_interval,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn acquire_creates_single_session() {
        let (addr, identities) = spawn_stub_parent().await;
        let pool = test_pool(addr, Duration::from_secs(5));

        let (_s1, flow1) = pool.acquire_flow().await.unwrap();
        let (_s2, flow2) = pool.acquire_flow().await.unwrap();
        assert_ne!(flow1, flow2);
        assert_eq!(pool.live_sessions(), 1);
        assert_eq!(identities.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn contended_gate_fails_fast() {
        let (addr, _identities) = spawn_stub_parent().await;
        let pool = test_pool(addr, Duration::from_secs(5));

        let _held = pool.gate.try_acquire().unwrap();
        let err = pool.acquire_flow().await.unwrap_err();
        assert!(err.is_busy());
    }

    #[tokio::test]
    async fn watcher_evicts_dead_session() {
        let (addr, identities) = spawn_stub_parent().await;
        let pool = test_pool(addr, Duration::from_millis(50));

        let (stream, _flow) = pool.acquire_flow().await.unwrap();
        assert_eq!(pool.live_sessions(), 1);

        // Kill the session from our side; the driver observes the close and
        // the watcher evicts the slot within one interval.
        drop(stream);
        let session = pool.sessions.get(&0).map(|entry| entry.value().clone());
        if let Some(session) = session {
            session.close().await;
        }
        for _ in 0..40 {
            if pool.live_sessions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(pool.live_sessions(), 0);

        // The next acquire dials a fresh session.
        let (_s, _flow) = pool.acquire_flow().await.unwrap();
        assert_eq!(pool.live_sessions(), 1);
        assert_eq!(identities.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_all_is_idempotent() {
        let (addr, _identities) = spawn_stub_parent().await;
        let pool = test_pool(addr, Duration::from_secs(5));

        let _ = pool.acquire_flow().await.unwrap();
        pool.close_all().await;
        assert_eq!(pool.live_sessions(), 0);
        pool.close_all().await;
    }
}
