//! Per-session tunables.

use std::time::Duration;

use arcgate_protocol::DEFAULT_COMPRESSION_THRESHOLD;
use arcgate_transport::DEFAULT_BUFFER_CAPACITY;
use serde::{Deserialize, Serialize};

/// Configuration for session behavior.
///
/// Game developers can customize these when setting up the gateway or
/// client. Sensible defaults are provided, and every field may be
/// omitted from a JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on every read and flush, in milliseconds.
    pub io_timeout_ms: u64,

    /// How many consecutive read timeouts the dispatcher absorbs before
    /// reporting one to the session loop.
    pub io_retry_times: u32,

    /// How long (in seconds) an `Inactive` session waits for the client
    /// to reconnect before it dies.
    pub inactive_timeout_secs: u64,

    /// Longest single wait (in seconds) while `Inactive`; the loop wakes
    /// at least this often to re-check its deadline.
    pub inactive_wait_window_secs: u64,

    /// Bytes of sent frames retained for replay after a reconnect.
    pub buffer_capacity: usize,

    /// Bodies smaller than this are never compressed.
    pub compression_threshold: usize,

    /// Capacity of each outbound queue (data and events).
    pub send_queue_size: usize,

    /// Capacity of each inbound listener channel.
    pub recv_queue_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: 3_000,
            io_retry_times: 3,
            inactive_timeout_secs: 60,
            inactive_wait_window_secs: 10,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            send_queue_size: 256,
            recv_queue_size: 256,
        }
    }
}

impl SessionConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_secs(self.inactive_timeout_secs)
    }

    pub fn inactive_wait_window(&self) -> Duration {
        // A zero window would spin.
        Duration::from_secs(self.inactive_wait_window_secs.max(1))
    }
}
