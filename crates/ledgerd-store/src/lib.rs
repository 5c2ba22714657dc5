//! Durable store for the ledgerd event ledger.
//!
//! Persistence is dual-sink. The append-only log is the durability root;
//! the `SQLite` index is a derived projection for filtered lookups that can
//! always be rebuilt from the log.
//!
//! # Architecture
//!
//! ```text
//! emit
//!   |
//!   +-- 1. EventLog::append      (JSON line, flush + fsync)   authoritative
//!   +-- 2. EventIndex::insert    (SQLite row)                 derived
//!   +-- 3. DedupeRegistry::register
//! ```
//!
//! # Modules
//!
//! - [`log`] -- Append-only JSONL log with torn-tail repair and rollback
//! - [`index`] -- `SQLite` index with unique constraints and filtered queries
//! - [`query`] -- [`EventQuery`] filter builder
//! - [`registry`] -- In-memory dedupe registry rebuilt from the log
//! - [`recovery`] -- Data directory bootstrap and index reconciliation
//! - [`error`] -- Shared error types

pub mod error;
pub mod index;
pub mod log;
pub mod query;
pub mod recovery;
pub mod registry;

// Re-export primary types for convenience.
pub use error::StoreError;
pub use index::{EventIndex, EventRow, INDEX_FILE_NAME};
pub use log::{EventLog, LOG_FILE_NAME, LogReplay};
pub use query::{DEFAULT_QUERY_LIMIT, EventQuery, MAX_QUERY_LIMIT};
pub use recovery::{RecoveredStore, RecoveryReport, StoreLayout, open_store, reconcile_index};
pub use registry::DedupeRegistry;
