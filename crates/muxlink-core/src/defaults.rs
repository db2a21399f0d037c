//! Default configuration values and fixed intervals.

use std::time::Duration;

/// Default per-operation timeout in milliseconds (dial, handshake write,
/// bounded UDP stream writes).
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default number of session slots to the parent.
pub const DEFAULT_SESSION_COUNT: usize = 1;

/// Interval between session liveness checks by the background watcher.
pub const SESSION_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between failed stream-acquisition attempts on the TCP path.
pub const TCP_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Delay before retrying a busy session gate on the UDP path.
pub const UDP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Interval between idle sweeps over the UDP virtual-connection table.
pub const UDP_GC_INTERVAL: Duration = Duration::from_secs(1);

/// Idle threshold after which a UDP virtual connection is collected.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Relay buffer size per pump direction.
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Receive buffer for inbound UDP datagrams.
pub const UDP_RECV_BUFFER_SIZE: usize = 65536;
