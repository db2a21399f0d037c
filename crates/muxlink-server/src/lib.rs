//! Reverse tunnel relay ingress.
//!
//! Accepts inbound TCP or UDP traffic on a local address and forwards each
//! flow over shared multiplexed sessions to a remote parent, tagged with a
//! destination address and flow identifier. The parent terminates each
//! stream and connects to the real destination; payload flows transparently
//! in both directions, optionally compressed.
//!
//! # Architecture
//!
//! - **Session pool** ([`session`]): lazily dials the parent, wraps the
//!   connection as a client-role yamux session, and hands out streams.
//!   Session creation is single-flight across all slots.
//! - **TCP path** ([`relay`]): one task per accepted connection pumping
//!   bytes between the socket and its parent stream.
//! - **UDP path** ([`udp`]): a virtual-connection table mapping datagram
//!   source addresses onto long-lived streams, with an idle sweep.
//! - **Transports** ([`transport`]): plain TCP, TLS, or KCP to the parent,
//!   optionally chained through an HTTP CONNECT or SOCKS5 jumper.

pub mod cli;
pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;
pub mod udp;

pub use config::ServerConfig;
pub use error::RelayError;
pub use server::RelayManager;
