//! TCP flow relay: accept loop and per-connection handler.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use muxlink_core::defaults::{RELAY_BUFFER_SIZE, TCP_RETRY_DELAY};
use muxlink_core::io::{pump, pump_compressed};

use crate::error::RelayError;
use crate::session::SessionPool;

/// Accept local TCP connections and relay each over a parent stream.
///
/// A failure inside one connection's handler never affects the accept loop
/// or other connections; each handler runs on its own task and reports only
/// through logs.
pub async fn serve_tcp(
    listener: TcpListener,
    pool: Arc<SessionPool>,
    compress: bool,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("tcp accept loop stopped");
                return Ok(());
            }

            res = listener.accept() => {
                let (conn, peer) = res?;
                let pool = pool.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(
                    async move {
                        handle_flow(conn, pool, compress, shutdown).await;
                    }
                    .instrument(info_span!("flow", peer = %peer)),
                );
            }
        }
    }
}

/// Relay one accepted connection: acquire a stream (retrying until the server
/// stops), then pump bytes until either side closes.
async fn handle_flow(
    conn: TcpStream,
    pool: Arc<SessionPool>,
    compress: bool,
    shutdown: CancellationToken,
) {
    let (stream, flow_id) = loop {
        if shutdown.is_cancelled() {
            return;
        }
        match pool.acquire_flow().await {
            Ok(acquired) => break acquired,
            Err(err) => {
                if err.is_busy() {
                    debug!("session gate busy, retrying");
                } else {
                    warn!(error = %err, "connect to parent failed, retrying");
                }
                tokio::time::sleep(TCP_RETRY_DELAY).await;
            }
        }
    };

    info!(key = %pool.key(), flow = %flow_id, "stream created");

    let result = if compress {
        pump_compressed(conn, stream, RELAY_BUFFER_SIZE).await
    } else {
        pump(conn, stream, RELAY_BUFFER_SIZE).await.map(|_| ())
    };
    if let Err(err) = result {
        debug!(flow = %flow_id, error = %err, "flow ended with error");
    }

    info!(key = %pool.key(), flow = %flow_id, "stream released");
}
