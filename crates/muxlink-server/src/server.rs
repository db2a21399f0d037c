//! Per-route relay server and the multi-route manager.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use muxlink_core::defaults::{SESSION_WATCH_INTERVAL, UDP_GC_INTERVAL, UDP_IDLE_TIMEOUT};

use crate::config::{RouteSpec, ServerConfig};
use crate::error::RelayError;
use crate::relay::serve_tcp;
use crate::session::SessionPool;
use crate::transport::Connector;
use crate::udp::{serve_udp, UdpTable};

/// One relay instance: a local listener bridged to the parent session pool.
pub struct RelayServer {
    route: RouteSpec,
    compress: bool,
    timeout: Duration,
    pool: Arc<SessionPool>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl RelayServer {
    pub fn new(
        cfg: &ServerConfig,
        route: RouteSpec,
        server_id: String,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, RelayError> {
        let connector = Connector::build(cfg)?;
        let scheme = if route.is_udp { "udp" } else { "tcp" };
        let dest = format!("{scheme}:{}", route.remote);
        let pool = SessionPool::new(
            connector,
            cfg.parent.clone(),
            route.key.clone(),
            server_id,
            dest,
            Duration::from_millis(cfg.timeout_ms),
            cfg.session_count,
            SESSION_WATCH_INTERVAL,
            shutdown.clone(),
        );
        Ok(Arc::new(Self {
            route,
            compress: cfg.compress,
            timeout: Duration::from_millis(cfg.timeout_ms),
            pool,
            shutdown,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Bind the local listener and start serving. Returns the bound address
    /// once the listener is up; serving continues on background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, RelayError> {
        if self.route.is_udp {
            let socket = Arc::new(UdpSocket::bind(&self.route.local).await?);
            let local = socket.local_addr()?;
            info!(address = %local, "udp server on");

            let table = UdpTable::new(
                self.pool.clone(),
                socket.clone(),
                self.timeout,
                UDP_IDLE_TIMEOUT,
                self.shutdown.clone(),
            );
            table.spawn_gc(UDP_GC_INTERVAL);

            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_udp(socket, table, shutdown).await {
                    error!(error = %e, "udp receive loop failed");
                }
            });
            Ok(local)
        } else {
            let listener = TcpListener::bind(&self.route.local).await?;
            let local = listener.local_addr()?;
            info!(address = %local, "tcp server on");

            let pool = self.pool.clone();
            let compress = self.compress;
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_tcp(listener, pool, compress, shutdown).await {
                    error!(error = %e, "tcp accept loop failed");
                }
            });
            Ok(local)
        }
    }

    /// Stop serving: cancel the loops and close every parent session.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.pool.close_all().await;
        info!(local = %self.route.local, "service stopped");
    }
}

/// Starts one relay server per expanded route and owns their shared identity.
pub struct RelayManager {
    server_id: String,
    servers: Vec<Arc<RelayServer>>,
    locals: Vec<SocketAddr>,
}

impl RelayManager {
    /// Validate the configuration and bring up every route.
    pub async fn start(
        cfg: ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, RelayError> {
        cfg.validate()?;

        let server_id = Uuid::new_v4().simple().to_string();
        info!(kind = ?cfg.parent_kind, parent = %cfg.parent, "using parent");
        info!(server_id = %server_id, "server id");

        let mut servers = Vec::new();
        let mut locals = Vec::new();
        for route in cfg.expand_routes()? {
            let server = RelayServer::new(&cfg, route, server_id.clone(), shutdown.child_token())?;
            locals.push(server.start().await?);
            servers.push(server);
        }

        Ok(Self {
            server_id,
            servers,
            locals,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Bound local addresses, one per route, in route order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.locals
    }

    /// Stop every route. Best-effort and idempotent.
    pub async fn stop(&self) {
        for server in &self.servers {
            server.stop().await;
        }
    }
}
