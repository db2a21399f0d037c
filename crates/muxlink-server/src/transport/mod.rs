//! Parent transport dialers.
//!
//! A `Connector` turns the configured parent address into a raw duplex byte
//! connection, dispatching on the configured transport kind: plain TCP, TLS
//! (optionally through a jumper), or KCP. The produced stream is type-erased
//! so the session layer does not care which transport carried it.

pub mod jumper;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_kcp::{KcpConfig, KcpStream};
use tokio_rustls::TlsConnector;

use crate::config::{ParentKind, ServerConfig};
use crate::error::RelayError;
use jumper::Jumper;

/// Marker trait for streams usable by the session layer.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> TransportStream for T {}

/// A dialed parent connection, type-erased across transports.
pub type ParentStream = Box<dyn TransportStream>;

/// Dials the parent with the configured transport.
pub enum Connector {
    Tcp {
        jumper: Option<Jumper>,
    },
    Tls {
        connector: TlsConnector,
        server_name: rustls::ServerName,
        jumper: Option<Jumper>,
    },
    Kcp {
        config: KcpConfig,
    },
}

impl Connector {
    /// Build the connector for this configuration.
    pub fn build(cfg: &ServerConfig) -> Result<Self, RelayError> {
        let jumper = cfg.jumper.as_deref().map(Jumper::parse).transpose()?;
        match cfg.parent_kind {
            ParentKind::Tcp => Ok(Connector::Tcp { jumper }),
            ParentKind::Tls => {
                let client_config = tls::client_config(cfg.tls.as_ref())?;
                let host = cfg
                    .parent
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(cfg.parent.as_str());
                let server_name = rustls::ServerName::try_from(host).map_err(|_| {
                    RelayError::Config(format!("invalid parent host {host:?}"))
                })?;
                Ok(Connector::Tls {
                    connector: TlsConnector::from(Arc::new(client_config)),
                    server_name,
                    jumper,
                })
            }
            ParentKind::Kcp => Ok(Connector::Kcp {
                config: KcpConfig::default(),
            }),
        }
    }

    /// Dial `addr` within `limit`.
    pub async fn connect(
        &self,
        addr: &str,
        limit: Duration,
    ) -> Result<ParentStream, RelayError> {
        match self {
            Connector::Tcp { jumper } => {
                let tcp = dial_tcp(addr, limit, jumper.as_ref()).await?;
                Ok(Box::new(tcp))
            }
            Connector::Tls {
                connector,
                server_name,
                jumper,
            } => {
                let tcp = dial_tcp(addr, limit, jumper.as_ref()).await?;
                let tls = timeout(limit, connector.connect(server_name.clone(), tcp))
                    .await
                    .map_err(|_| RelayError::DialTimeout(addr.to_string()))??;
                Ok(Box::new(tls))
            }
            Connector::Kcp { config } => {
                let mut resolved = timeout(limit, tokio::net::lookup_host(addr))
                    .await
                    .map_err(|_| RelayError::DialTimeout(addr.to_string()))??;
                let target = resolved
                    .next()
                    .ok_or_else(|| RelayError::Dial(format!("{addr} did not resolve")))?;
                let stream = timeout(limit, KcpStream::connect(config, target))
                    .await
                    .map_err(|_| RelayError::DialTimeout(addr.to_string()))?
                    .map_err(|e| RelayError::Dial(e.to_string()))?;
                Ok(Box::new(stream))
            }
        }
    }
}

async fn dial_tcp(
    addr: &str,
    limit: Duration,
    jumper: Option<&Jumper>,
) -> Result<TcpStream, RelayError> {
    let stream = match jumper {
        Some(jumper) => jumper.dial(addr, limit).await?,
        None => timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| RelayError::DialTimeout(addr.to_string()))??,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}
