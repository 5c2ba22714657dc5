//! Event ledger daemon for multi-agent simulations.
//!
//! Every state change in the simulation is recorded here as an immutable,
//! totally ordered, deduplicated event. Everything else (world state,
//! projections, dashboards) is derived from the ledger.
//!
//! # Architecture
//!
//! ```text
//!                    +-------------------+
//!   emit / submit -> |      Ledger       | -- writer lock: dedupe, sequence,
//!                    |  (single writer)  |    log, index, registry, enqueue
//!                    +---------+---------+
//!                              |
//!              +---------------+----------------+
//!              |                                |
//!        mpsc -> dispatcher task          broadcast::Receiver
//!        -> EventListener (blocking       (async, may lag)
//!           pool, timeout, in order)
//!
//!   Daemon = Ledger + HeartbeatController + lifecycle events + health
//! ```
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with environment overrides
//! - [`ledger`] -- The write path, queries, reindex and parity checks
//! - [`listener`] -- Listener registry and dispatcher with failure isolation
//! - [`heartbeat`] -- Periodic liveness events
//! - [`health`] -- [`HealthSnapshot`]
//! - [`daemon`] -- [`Daemon`] lifecycle
//! - [`error`] -- Error types

pub mod config;
pub mod daemon;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod ledger;
pub mod listener;

pub use config::{ConfigError, DaemonConfig, LoggingConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, EmitError, QueryError};
pub use health::HealthSnapshot;
pub use heartbeat::{DAEMON_ACTOR, HeartbeatController, HeartbeatStats};
pub use ledger::{
    EmitOutcome, GLOBAL_SUBJECT, Ledger, LedgerOptions, LedgerStatus, ParityResult, SYSTEM_ACTOR,
};
pub use listener::{DispatchReport, EventListener, ListenerError, ListenerId, ListenerRegistry};

pub use ledgerd_store::{EventQuery, MAX_QUERY_LIMIT, RecoveryReport};
pub use ledgerd_types::{DedupeKey, Event, EventDraft, EventId, EventType, Payload, SessionId};
