//! Relay tunables.
//!
//! Every session receives one [`RelayConfig`] by value. Nothing in the relay
//! reads process-wide state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Retry budget shared by connect-phase and stream-phase failures.
    pub max_retries: u32,
    /// Pause before probing the gateway after a failure.
    pub retry_delay_ms: u64,
    /// How long to keep probing the liveness endpoint before reconnecting anyway.
    pub liveness_timeout_secs: u64,
    /// Timeout of a single liveness probe.
    pub liveness_probe_timeout_secs: u64,
    /// Interval between liveness probes.
    pub liveness_poll_ms: u64,
    pub connect_timeout_secs: u64,
    /// Per-read timeout while the gateway blocks in its tool loop.
    pub read_timeout_secs: u64,
    /// Bounded wait on the next upstream delta before draining tool events.
    pub upstream_wait_ms: u64,
    /// Poll interval of the log tailer when no new bytes are available.
    pub log_poll_ms: u64,
    /// Capacity of the tailer -> merge engine channel.
    pub event_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 3_000,
            liveness_timeout_secs: 20,
            liveness_probe_timeout_secs: 3,
            liveness_poll_ms: 500,
            connect_timeout_secs: 30,
            read_timeout_secs: 1_800,
            upstream_wait_ms: 100,
            log_poll_ms: 50,
            event_buffer: 256,
        }
    }
}

impl RelayConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn liveness_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_probe_timeout_secs)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn upstream_wait(&self) -> Duration {
        Duration::from_millis(self.upstream_wait_ms.max(1))
    }

    pub fn log_poll(&self) -> Duration {
        Duration::from_millis(self.log_poll_ms.max(1))
    }
}
