//! Data directory bootstrap and cold-start recovery.
//!
//! Opening a store brings both sinks back to parity before any write is
//! accepted:
//!
//! ```text
//! data_dir/
//!   events.jsonl   -- replay, repair torn tail, check contiguity
//!   index.db       -- prune rows past the log, restore missing rows
//!        |
//!        +--> DedupeRegistry rebuilt from the log (never the index)
//!        +--> next sequence id = last log sequence id + 1
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ledgerd_types::Event;

use crate::error::StoreError;
use crate::index::{EventIndex, INDEX_FILE_NAME};
use crate::log::{EventLog, LOG_FILE_NAME};
use crate::registry::DedupeRegistry;

/// File locations inside a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    /// The data directory itself.
    pub data_dir: PathBuf,
    /// The append-only log.
    pub log_path: PathBuf,
    /// The `SQLite` index.
    pub index_path: PathBuf,
}

impl StoreLayout {
    /// Standard layout under `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            log_path: data_dir.join(LOG_FILE_NAME),
            index_path: data_dir.join(INDEX_FILE_NAME),
        }
    }
}

/// What recovery found and repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Events replayed from the log.
    pub events_replayed: u64,
    /// Bytes of torn trailing write discarded from the log.
    pub discarded_tail_bytes: u64,
    /// Index rows re-inserted from the log.
    pub index_rows_restored: u64,
    /// Index rows deleted because the log does not contain them.
    pub index_rows_pruned: u64,
}

/// A store opened and reconciled, ready to accept appends.
#[derive(Debug)]
pub struct RecoveredStore {
    /// Writer handle on the log.
    pub log: EventLog,
    /// The reconciled index.
    pub index: EventIndex,
    /// Dedupe registry rebuilt from the log.
    pub registry: DedupeRegistry,
    /// Highest sequence id in the log, 0 when empty.
    pub last_sequence_id: u64,
    /// Timestamp of the last logged event.
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Details of the recovery.
    pub report: RecoveryReport,
}

/// Open the store under `layout`, creating the data directory if needed.
///
/// # Errors
///
/// Returns [`StoreError`] if the directory cannot be created, the log is
/// corrupt, or the index cannot be opened or reconciled. Any such error is
/// fatal for startup: sequence recovery must not guess.
pub async fn open_store(layout: &StoreLayout) -> Result<RecoveredStore, StoreError> {
    tokio::fs::create_dir_all(&layout.data_dir).await?;

    let (log, replay) = EventLog::open(&layout.log_path).await?;
    let index = EventIndex::open(&layout.index_path).await?;

    let (index_rows_restored, index_rows_pruned) = reconcile_index(&index, &replay.events).await?;
    let registry = DedupeRegistry::from_events(&replay.events);

    let last = replay.events.last();
    let last_sequence_id = last.map_or(0, |e| e.sequence_id);
    let last_timestamp = last.map(|e| e.timestamp);

    let report = RecoveryReport {
        events_replayed: u64::try_from(replay.events.len()).unwrap_or(u64::MAX),
        discarded_tail_bytes: replay.discarded_tail_bytes,
        index_rows_restored,
        index_rows_pruned,
    };

    tracing::info!(
        data_dir = %layout.data_dir.display(),
        last_sequence_id,
        events_replayed = report.events_replayed,
        index_rows_restored,
        index_rows_pruned,
        "Store recovered"
    );

    Ok(RecoveredStore {
        log,
        index,
        registry,
        last_sequence_id,
        last_timestamp,
        report,
    })
}

/// Bring the index to exactly the log's event set.
///
/// Returns `(restored, pruned)` row counts.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if any index operation fails.
pub async fn reconcile_index(
    index: &EventIndex,
    events: &[Event],
) -> Result<(u64, u64), StoreError> {
    let log_max = events.last().map_or(0, |e| e.sequence_id);

    let pruned = index.delete_after(log_max).await?;
    if pruned > 0 {
        tracing::warn!(pruned, log_max, "Pruned index rows missing from the event log");
    }

    let indexed = index.count().await?;
    let logged = u64::try_from(events.len()).unwrap_or(u64::MAX);
    let restored = if indexed == logged {
        0
    } else {
        let restored = index.insert_missing(events).await?;
        tracing::warn!(restored, indexed, logged, "Rebuilt missing index rows from the event log");
        restored
    };

    Ok((restored, pruned))
}
