//! Health snapshot served to overseers.

use chrono::{DateTime, Utc};
use ledgerd_types::SessionId;
use serde::Serialize;

/// Point-in-time view of the daemon. Safe to take while emits are in
/// flight; individual counters may be one event apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Whether the heartbeat is running.
    pub running: bool,
    /// Heartbeats committed in this session.
    pub heartbeat_count: u64,
    /// Time of the last committed heartbeat.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Events in the log.
    pub total_events: u64,
    /// Highest committed sequence id, 0 when empty.
    pub last_sequence_id: u64,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// The last log append failed.
    pub degraded: bool,
    /// The index is missing committed events until the next reindex.
    pub index_stale: bool,
    /// Identifier of this daemon session.
    pub session_id: SessionId,
    /// When the daemon was last started.
    pub started_at: Option<DateTime<Utc>>,
    /// Registered synchronous listeners.
    pub listener_count: usize,
}

impl HealthSnapshot {
    /// Running, appending, and the index is complete.
    pub const fn is_healthy(&self) -> bool {
        self.running && !self.degraded && !self.index_stale
    }
}
