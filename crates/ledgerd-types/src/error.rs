//! Validation errors for event construction.

/// Reasons an event draft is rejected before anything is persisted.
///
/// These are the caller's fault and are never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The event type is empty or whitespace only.
    #[error("event_type must be non-empty")]
    EmptyEventType,

    /// The actor id is empty or whitespace only.
    #[error("actor_id must be non-empty")]
    EmptyActorId,

    /// An optional identifier was supplied but is empty.
    #[error("{field} must be non-empty when present")]
    EmptyOptionalField {
        /// The offending field name.
        field: &'static str,
    },

    /// A payload was built from a JSON value that is not an object.
    #[error("payload must be a JSON object")]
    PayloadNotObject,
}
