//! Error types for the ledger and daemon.
//!
//! Each variant maps to one failure mode. Errors carry enough context for
//! structured logging without leaking internal representation details.

use ledgerd_store::StoreError;
use ledgerd_types::ValidationError;

use crate::config::ConfigError;

/// Errors returned from the emit path.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// The draft was rejected before anything was written.
    #[error("event rejected: {0}")]
    Validation(#[from] ValidationError),

    /// The log append failed. Nothing was committed and the sequence id was
    /// not consumed.
    #[error("event log append failed: {0}")]
    Persistence(#[source] StoreError),

    /// The sequence id space is exhausted.
    #[error("sequence id space exhausted after {0}")]
    SequenceExhausted(u64),

    /// The ledger was closed; nothing is accepted any more.
    #[error("ledger is closed")]
    Closed,

    /// The commit task ended without reporting a result.
    #[error("commit task aborted: {0}")]
    Aborted(String),
}

/// Errors returned from index reads.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The index could not answer the query.
    #[error("index query failed: {0}")]
    Index(#[from] StoreError),
}

/// Errors returned from daemon lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Configuration was invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The store could not be opened or reconciled.
    #[error("store recovery failed: {0}")]
    Recovery(#[from] StoreError),

    /// A lifecycle event could not be committed.
    #[error("lifecycle event failed: {0}")]
    Lifecycle(#[from] EmitError),

    /// Flushing the store on stop failed.
    #[error("flush failed: {0}")]
    Flush(#[source] StoreError),
}
