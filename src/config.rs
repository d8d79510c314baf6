//! Relay configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a relay instance.
///
/// Duration-valued settings are stored as integer seconds so the struct
/// serializes cleanly; use the accessor methods where a [`Duration`] is
/// needed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Address the relay listens on for agent connections.
    pub listen_tcp: SocketAddr,
    /// Path for the durable offline queue. `None` keeps the queue in memory
    /// (messages do not survive a restart).
    pub queue_path: Option<PathBuf>,
    /// How long a queued message stays deliverable. Default: 7 days.
    pub message_ttl_secs: u64,
    /// Expected client heartbeat cadence; also the sweeper interval.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age beyond which a session is presumed dead and evicted.
    pub ping_timeout_secs: u64,
    /// Bound on one live push, from hand-off to transport confirmation.
    pub push_timeout_secs: u64,
    pub max_frame_bytes: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_tcp: SocketAddr::from(([127, 0, 0, 1], 4300)),
            queue_path: None,
            message_ttl_secs: 7 * 24 * 60 * 60,
            heartbeat_interval_secs: 30,
            ping_timeout_secs: 90,
            push_timeout_secs: 10,
            max_frame_bytes: crate::transport::MAX_FRAME_BYTES,
        }
    }
}

impl RelayConfig {
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }
}
