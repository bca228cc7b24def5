use std::time::Duration;

use crate::codec::DEFAULT_MAX_LINE_LENGTH;

/// Tunables for a relay instance. `serve` CLI flags map onto these fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// How long to wait for a structured `join` record before announcing
    /// capabilities and falling back to the legacy protocol.
    pub detect_timeout: Duration,
    /// Upper bound on the whole identification phase.
    pub identify_timeout: Duration,
    pub max_line_length: usize,
    /// Lines kept per room by the in-memory history; zero disables it.
    pub history_capacity: usize,
    /// Lines replayed to a user right after a successful room join.
    pub history_replay: usize,
    /// Lines queued per session before a non-reading peer is evicted.
    pub outbound_capacity: usize,
    /// Longest a single write to a peer may block.
    pub write_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            detect_timeout: Duration::from_secs(1),
            identify_timeout: Duration::from_secs(60),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            history_capacity: 500,
            history_replay: 0,
            outbound_capacity: 1024,
            write_timeout: Duration::from_secs(10),
        }
    }
}
