//! Error types for the durable store.
//!
//! All errors are propagated via [`StoreError`], which wraps the underlying
//! I/O, [`serde_json`] and [`sqlx`] errors with context about which sink
//! failed.

/// Errors that can occur in the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A filesystem operation on the log or data directory failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A `SQLite` index operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Applying the index schema failed.
    #[error("SQLite migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A complete line in the log is not a valid event.
    #[error("corrupt log line {line}: {reason}")]
    CorruptLog {
        /// 1-based line number.
        line: u64,
        /// Why the line was rejected.
        reason: String,
    },

    /// The log's sequence ids are not contiguous from 1.
    #[error("sequence gap at log line {line}: expected {expected}, found {found}")]
    SequenceGap {
        /// 1-based line number.
        line: u64,
        /// The sequence id that should have been there.
        expected: u64,
        /// The sequence id that was found.
        found: u64,
    },

    /// An index row could not be converted back into an event.
    #[error("corrupt index row {sequence_id}: {reason}")]
    CorruptRow {
        /// The row's sequence id.
        sequence_id: i64,
        /// Why the row was rejected.
        reason: String,
    },

    /// A previous append failed and its partial write could not be rolled
    /// back. The log refuses further appends until the store is reopened.
    #[error("event log is poisoned by an unrecoverable write failure")]
    LogPoisoned,

    /// A sequence id does not fit the index's signed 64-bit column.
    #[error("sequence id {sequence_id} exceeds index range")]
    SequenceOverflow {
        /// The offending sequence id.
        sequence_id: u64,
        /// The failed conversion.
        #[source]
        source: std::num::TryFromIntError,
    },
}
