//! UDP virtual-connection table.
//!
//! Each distinct datagram source address gets a long-lived multiplexed stream
//! standing in for its "connection". Datagrams are written to the stream as
//! framed packets tagged with the source address; a dedicated receive loop
//! per entry forwards parent replies back out of the shared listener socket.
//! A periodic sweep collects entries idle past the threshold.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, info, warn};

use muxlink_core::defaults::UDP_RETRY_DELAY;

use crate::session::SessionPool;

/// One virtual connection: the stream standing in for a UDP source address.
struct UdpConn {
    writer: Mutex<WriteHalf<StreamHandle>>,
    /// Seconds since the table's epoch at last activity. Races between
    /// concurrent touches lose a few milliseconds at most, which is fine.
    touch: AtomicU64,
    src: SocketAddr,
    local: SocketAddr,
    flow_id: String,
    closer: CancellationToken,
}

impl UdpConn {
    fn touch_now(&self, epoch: Instant) {
        self.touch.store(epoch.elapsed().as_secs(), Ordering::Relaxed);
    }

    fn idle_secs(&self, epoch: Instant) -> u64 {
        epoch
            .elapsed()
            .as_secs()
            .saturating_sub(self.touch.load(Ordering::Relaxed))
    }
}

/// Table of virtual connections, keyed by the source address string.
pub struct UdpTable {
    pool: Arc<SessionPool>,
    socket: Arc<UdpSocket>,
    conns: DashMap<String, Arc<UdpConn>>,
    write_timeout: Duration,
    idle_timeout: Duration,
    epoch: Instant,
    shutdown: CancellationToken,
}

impl UdpTable {
    pub fn new(
        pool: Arc<SessionPool>,
        socket: Arc<UdpSocket>,
        write_timeout: Duration,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            socket,
            conns: DashMap::new(),
            write_timeout,
            idle_timeout,
            epoch: Instant::now(),
            shutdown,
        })
    }

    /// Handle one inbound datagram from the local listener.
    ///
    /// A table miss sets up the virtual connection inline — the caller is the
    /// single datagram-receive loop, so a second datagram from the same
    /// source cannot race a duplicate into the table. The write itself runs
    /// on its own task; ordering across datagrams from one source is not
    /// preserved.
    pub async fn on_datagram(self: &Arc<Self>, payload: Vec<u8>, local: SocketAddr, src: SocketAddr) {
        let key = src.to_string();
        let conn = match self.conns.get(&key).map(|entry| entry.value().clone()) {
            Some(conn) => conn,
            None => match self.open_conn(key, local, src).await {
                Some(conn) => conn,
                None => return, // failure already logged, datagram dropped
            },
        };

        let table = self.clone();
        tokio::spawn(async move {
            conn.touch_now(table.epoch);
            let frame = match muxlink_proto::build_udp_frame(&conn.src.to_string(), &payload) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(flow = %conn.flow_id, error = %err, "dropping datagram");
                    return;
                }
            };
            let mut writer = conn.writer.lock().await;
            match timeout(table.write_timeout, writer.write_all(&frame)).await {
                Ok(Ok(())) => {}
                // Datagram dropped, entry left in place.
                Ok(Err(err)) => {
                    warn!(flow = %conn.flow_id, error = %err, "udp stream write failed")
                }
                Err(_) => warn!(flow = %conn.flow_id, "udp stream write timed out"),
            }
        });
    }

    /// Acquire a stream for a previously unseen source and register it.
    ///
    /// The busy gate is retried on a short fixed delay; any other error drops
    /// the datagram. The receive loop is running before the first datagram is
    /// written.
    async fn open_conn(
        self: &Arc<Self>,
        key: String,
        local: SocketAddr,
        src: SocketAddr,
    ) -> Option<Arc<UdpConn>> {
        let (stream, flow_id) = loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            match self.pool.acquire_flow().await {
                Ok(acquired) => break acquired,
                Err(err) if err.is_busy() => {
                    tokio::time::sleep(UDP_RETRY_DELAY).await;
                }
                Err(err) => {
                    warn!(error = %err, "connect to parent failed, dropping datagram");
                    return None;
                }
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(UdpConn {
            writer: Mutex::new(writer),
            touch: AtomicU64::new(self.epoch.elapsed().as_secs()),
            src,
            local,
            flow_id,
            closer: CancellationToken::new(),
        });
        self.conns.insert(key.clone(), conn.clone());
        self.spawn_receive(key, conn.clone(), reader);
        info!(flow = %conn.flow_id, local = %conn.local, "udp conn connected");
        Some(conn)
    }

    /// One receive loop per virtual connection: framed parent replies flow
    /// back to the originating source via the shared listener socket.
    fn spawn_receive(
        self: &Arc<Self>,
        key: String,
        conn: Arc<UdpConn>,
        mut reader: ReadHalf<StreamHandle>,
    ) {
        let table = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = conn.closer.cancelled() => break,

                    res = muxlink_proto::read_udp_frame(&mut reader) => match res {
                        Ok((_, body)) => {
                            conn.touch_now(table.epoch);
                            if let Err(err) = table.socket.send_to(&body, conn.src).await {
                                warn!(flow = %conn.flow_id, error = %err, "udp reply send failed");
                            }
                        }
                        // Transient interruption, keep reading.
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            if err.kind() != io::ErrorKind::UnexpectedEof {
                                warn!(flow = %conn.flow_id, error = %err, "udp stream read failed");
                            }
                            break;
                        }
                    },
                }
            }

            // Task boundary: close the stream once, release this entry.
            conn.closer.cancel();
            {
                let mut writer = conn.writer.lock().await;
                let _ = writer.shutdown().await;
            }
            table
                .conns
                .remove_if(&key, |_, entry| Arc::ptr_eq(entry, &conn));
            info!(flow = %conn.flow_id, "udp conn released");
        });
    }

    /// Collect entries idle past the threshold. Entries are closed during the
    /// scan and removed after it completes.
    pub fn sweep(&self) -> usize {
        let mut stale = Vec::new();
        for entry in self.conns.iter() {
            if entry.value().idle_secs(self.epoch) > self.idle_timeout.as_secs() {
                entry.value().closer.cancel();
                info!(flow = %entry.value().flow_id, "gc udp conn");
                stale.push((entry.key().clone(), entry.value().clone()));
            }
        }
        let collected = stale.len();
        for (key, conn) in stale {
            self.conns
                .remove_if(&key, |_, entry| Arc::ptr_eq(entry, &conn));
        }
        collected
    }

    /// Start the periodic idle sweep.
    pub fn spawn_gc(self: &Arc<Self>, interval: Duration) {
        let table = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    _ = table.shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let collected = table.sweep();
                        if collected > 0 {
                            debug!(collected, "udp gc pass");
                        }
                    }
                }
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.conns.len()
    }
}

/// Receive datagrams from the local listener and feed them into the table.
pub async fn serve_udp(
    socket: Arc<UdpSocket>,
    table: Arc<UdpTable>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let local = socket.local_addr()?;
    let mut buf = vec![0u8; muxlink_core::defaults::UDP_RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("udp receive loop stopped");
                return Ok(());
            }

            res = socket.recv_from(&mut buf) => {
                let (n, src) = res?;
                table.on_datagram(buf[..n].to_vec(), local, src).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Connector;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt as _;
    use tokio_yamux::session::SessionType;
    use tokio_yamux::{Config as YamuxConfig, Session};

    /// A connected pair of yamux streams over an in-memory duplex.
    async fn yamux_stream_pair() -> (StreamHandle, StreamHandle) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = Session::new(a, YamuxConfig::default(), SessionType::Client);
        let mut server = Session::new(b, YamuxConfig::default(), SessionType::Server);
        let mut control = client.control();

        tokio::spawn(async move { while client.next().await.is_some() {} });
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut tx = Some(tx);
            while let Some(res) = server.next().await {
                match res {
                    Ok(stream) => {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(stream);
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let local = control.open_stream().await.unwrap();
        let remote = rx.await.unwrap();
        (local, remote)
    }

    async fn test_table(idle_timeout: Duration) -> Arc<UdpTable> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let pool = SessionPool::new(
            Connector::Tcp { jumper: None },
            "127.0.0.1:1".into(),
            "k".into(),
            "srv".into(),
            "udp:127.0.0.1:53".into(),
            Duration::from_secs(1),
            1,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        UdpTable::new(
            pool,
            socket,
            Duration::from_secs(1),
            idle_timeout,
            CancellationToken::new(),
        )
    }

    fn insert_conn(table: &Arc<UdpTable>, src: SocketAddr, stream: StreamHandle) -> Arc<UdpConn> {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(UdpConn {
            writer: Mutex::new(writer),
            touch: AtomicU64::new(table.epoch.elapsed().as_secs()),
            src,
            local: table.socket.local_addr().unwrap(),
            flow_id: "f-test".into(),
            closer: CancellationToken::new(),
        });
        table.conns.insert(src.to_string(), conn.clone());
        table.spawn_receive(src.to_string(), conn.clone(), reader);
        conn
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_collects_idle_entries() {
        let table = test_table(Duration::from_secs(60)).await;
        let (local, _remote) = yamux_stream_pair().await;
        let src: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let conn = insert_conn(&table, src, local);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(table.sweep(), 0);
        assert_eq!(table.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 0);
        assert!(conn.closer.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_touched_entries() {
        let table = test_table(Duration::from_secs(60)).await;
        let (local, _remote) = yamux_stream_pair().await;
        let src: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let conn = insert_conn(&table, src, local);

        tokio::time::advance(Duration::from_secs(59)).await;
        conn.touch_now(table.epoch);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(table.sweep(), 0);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn receive_loop_forwards_replies() {
        let table = test_table(Duration::from_secs(60)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let src = client.local_addr().unwrap();

        let (local, mut remote) = yamux_stream_pair().await;
        insert_conn(&table, src, local);

        // Parent replies with a framed datagram; the loop forwards the
        // payload to the originating source via the shared socket.
        let frame = muxlink_proto::build_udp_frame(&src.to_string(), b"pong").unwrap();
        remote.write_all(&frame).await.unwrap();
        remote.flush().await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, table.socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn receive_loop_eof_releases_entry() {
        let table = test_table(Duration::from_secs(60)).await;
        let src: SocketAddr = "127.0.0.1:5002".parse().unwrap();

        let (local, mut remote) = yamux_stream_pair().await;
        insert_conn(&table, src, local);
        assert_eq!(table.len(), 1);

        remote.shutdown().await.unwrap();
        for _ in 0..50 {
            if table.len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(table.len(), 0);
    }
}
