//! Error types for the relay engine.

use thiserror::Error;

/// Errors that can occur while relaying.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("config error: {0}")]
    Config(String),

    /// The single-flight session gate is held by another caller. Transient;
    /// callers retry instead of treating this as a failure.
    #[error("can not connect at same time")]
    Busy,

    #[error("dial timeout to {0}")]
    DialTimeout(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("mux session error: {0}")]
    Mux(String),

    #[error("jumper error: {0}")]
    Jumper(String),

    #[error("frame error: {0}")]
    Frame(#[from] muxlink_proto::FrameError),
}

impl RelayError {
    /// Whether this is transient gate contention rather than a real failure.
    pub fn is_busy(&self) -> bool {
        matches!(self, RelayError::Busy)
    }
}
