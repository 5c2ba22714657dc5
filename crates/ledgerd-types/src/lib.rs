//! Event model for the ledgerd event ledger.
//!
//! The ledger is the single source of truth for everything that happens in
//! a multi-agent simulation. This crate defines the record every other
//! component derives its view from, plus the deterministic generators the
//! ledger uses to identify and deduplicate events. Types flow downstream to
//! `TypeScript` via `ts-rs` for render layers.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers ([`EventId`], [`SessionId`])
//! - [`enums`] -- [`EventType`]: well-known daemon types plus open custom tags
//! - [`payload`] -- [`Payload`]: schema-versioned opaque key/value map
//! - [`dedupe`] -- [`DedupeKey`] derivation
//! - [`event`] -- [`Event`] (persisted) and [`EventDraft`] (emit input)
//! - [`error`] -- [`ValidationError`]

pub mod dedupe;
pub mod enums;
pub mod error;
pub mod event;
pub mod ids;
pub mod payload;

// Re-export all public types at crate root for convenience.
pub use dedupe::{DedupeInputs, DedupeKey};
pub use enums::EventType;
pub use error::ValidationError;
pub use event::{Event, EventDraft};
pub use ids::{EventId, SessionId};
pub use payload::{PAYLOAD_SCHEMA_VERSION, Payload};
