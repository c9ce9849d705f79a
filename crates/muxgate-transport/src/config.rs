//! Link and multiplexer configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for a single link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Capacity of the outbound message queue, in messages
    pub send_queue: usize,

    /// Largest message accepted in either direction, in bytes
    pub max_frame_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            send_queue: 1024,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

/// Tuning shared by the frontend and backend multiplexers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Settings for every physical and client link
    pub link: LinkConfig,

    /// Inbound queue capacity of each virtual connection, in payloads
    pub conn_queue: usize,

    /// Admitted connections waiting for `accept`, per backend listener
    pub ready_backlog: usize,

    /// Interval between PING frames sent by a frontend multiplexer
    pub heartbeat_interval_ms: Option<u64>,

    /// Close the physical link when no PONG arrived for this long
    pub heartbeat_timeout_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            conn_queue: 1024,
            ready_backlog: 1024,
            heartbeat_interval_ms: None,
            heartbeat_timeout_ms: 30_000,
        }
    }
}

impl MuxConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}
