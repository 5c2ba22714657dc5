//! The immutable event record and the draft it is built from.
//!
//! An [`EventDraft`] is what a caller hands to the ledger. The ledger
//! validates it, derives its [`DedupeKey`], and only then, inside the write
//! critical section, assigns the [`EventId`], sequence id and timestamp
//! that turn it into a persisted [`Event`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::dedupe::{DedupeInputs, DedupeKey};
use crate::enums::EventType;
use crate::error::ValidationError;
use crate::ids::EventId;
use crate::payload::Payload;

/// A persisted ledger event. Never mutated or deleted after append.
///
/// Serialized as one JSON object per line in the append-only log, with the
/// fields `event_id, sequence_id, event_type, actor_id, subject_id,
/// task_id, payload, timestamp, dedupe_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Event {
    /// Globally unique event identifier.
    pub event_id: EventId,
    /// Position in the total order, contiguous from 1.
    pub sequence_id: u64,
    /// The kind of occurrence.
    #[ts(type = "string")]
    pub event_type: EventType,
    /// Who caused the event.
    pub actor_id: String,
    /// The primary domain entity the event concerns, if any.
    pub subject_id: Option<String>,
    /// Secondary correlation identifier, if any.
    pub task_id: Option<String>,
    /// Opaque payload, stored and returned verbatim.
    pub payload: Payload,
    /// UTC instant of append. Never decreases as `sequence_id` increases.
    pub timestamp: DateTime<Utc>,
    /// Logical identity of the event.
    #[ts(type = "string")]
    pub dedupe_key: DedupeKey,
}

impl Event {
    /// Whether this is a heartbeat event.
    pub const fn is_heartbeat(&self) -> bool {
        matches!(self.event_type, EventType::Heartbeat)
    }
}

/// Input to an emit call: everything the caller decides about an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    /// The kind of occurrence.
    pub event_type: EventType,
    /// Who caused the event. Required, non-empty.
    pub actor_id: String,
    /// The primary entity, if any.
    pub subject_id: Option<String>,
    /// Correlation id, if any.
    pub task_id: Option<String>,
    /// Opaque payload.
    pub payload: Payload,
    /// Correlation reference folded into the computed dedupe key.
    pub source_ref: Option<String>,
    /// Explicit dedupe key. Overrides the computed one when set.
    pub dedupe_key: Option<DedupeKey>,
}

impl EventDraft {
    /// Start a draft with an empty payload and no optional fields.
    pub fn new(event_type: impl Into<EventType>, actor_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            actor_id: actor_id.into(),
            subject_id: None,
            task_id: None,
            payload: Payload::new(),
            source_ref: None,
            dedupe_key: None,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the subject id.
    #[must_use]
    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Set the task id.
    #[must_use]
    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Set the correlation reference.
    #[must_use]
    pub fn source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    /// Supply the dedupe key explicitly.
    #[must_use]
    pub fn dedupe_key(mut self, key: DedupeKey) -> Self {
        self.dedupe_key = Some(key);
        self
    }

    /// Check the required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_type.is_blank() {
            return Err(ValidationError::EmptyEventType);
        }
        if self.actor_id.trim().is_empty() {
            return Err(ValidationError::EmptyActorId);
        }
        let optional = [
            ("subject_id", self.subject_id.as_deref()),
            ("task_id", self.task_id.as_deref()),
            ("source_ref", self.source_ref.as_deref()),
            ("dedupe_key", self.dedupe_key.as_ref().map(DedupeKey::as_str)),
        ];
        for (field, value) in optional {
            if value.is_some_and(|v| v.trim().is_empty()) {
                return Err(ValidationError::EmptyOptionalField { field });
            }
        }
        Ok(())
    }

    /// The key this draft deduplicates under: the explicit one if supplied,
    /// otherwise the hash of its identity fields.
    pub fn resolve_dedupe_key(&self) -> DedupeKey {
        if let Some(key) = &self.dedupe_key {
            return key.clone();
        }
        DedupeKey::compute(&DedupeInputs {
            event_type: &self.event_type,
            actor_id: &self.actor_id,
            subject_id: self.subject_id.as_deref(),
            task_id: self.task_id.as_deref(),
            payload: &self.payload,
            source_ref: self.source_ref.as_deref(),
        })
    }

    /// Seal the draft into a persisted-shape [`Event`].
    pub fn into_event(
        self,
        event_id: EventId,
        sequence_id: u64,
        timestamp: DateTime<Utc>,
        dedupe_key: DedupeKey,
    ) -> Event {
        Event {
            event_id,
            sequence_id,
            event_type: self.event_type,
            actor_id: self.actor_id,
            subject_id: self.subject_id,
            task_id: self.task_id,
            payload: self.payload,
            timestamp,
            dedupe_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn validate_rejects_missing_required_fields() {
        assert_eq!(
            EventDraft::new("", "founder_0").validate(),
            Err(ValidationError::EmptyEventType)
        );
        assert_eq!(
            EventDraft::new("entity_created", " ").validate(),
            Err(ValidationError::EmptyActorId)
        );
        assert_eq!(
            EventDraft::new("entity_created", "founder_0")
                .subject("")
                .validate(),
            Err(ValidationError::EmptyOptionalField {
                field: "subject_id"
            })
        );
        assert!(EventDraft::new("entity_created", "founder_0")
            .validate()
            .is_ok());
    }

    #[test]
    fn explicit_dedupe_key_wins() {
        let draft = EventDraft::new("payout", "bank").dedupe_key(DedupeKey::from_raw("payout-42"));
        assert_eq!(draft.resolve_dedupe_key().as_str(), "payout-42");
    }

    #[test]
    fn computed_key_depends_on_source_ref() {
        let base = EventDraft::new("proof_submitted", "agent_3").task("task_9");
        let a = base.clone().source_ref("attempt-1").resolve_dedupe_key();
        let b = base.source_ref("attempt-2").resolve_dedupe_key();
        assert_ne!(a, b);
    }

    #[test]
    fn log_line_has_flat_field_names() {
        let draft = EventDraft::new("entity_created", "founder_0")
            .payload(Payload::new().with("name", "Alpha"));
        let key = draft.resolve_dedupe_key();
        let event = draft.into_event(EventId::new(), 1, Utc::now(), key);

        let value = serde_json::to_value(&event).unwrap_or(Value::Null);
        let fields: Vec<&str> = value
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        for expected in [
            "event_id",
            "sequence_id",
            "event_type",
            "actor_id",
            "subject_id",
            "task_id",
            "payload",
            "timestamp",
            "dedupe_key",
        ] {
            assert!(fields.contains(&expected), "missing {expected}");
        }
        assert_eq!(value["event_type"], "entity_created");
        assert_eq!(value["sequence_id"], 1);

        let back: Option<Event> = serde_json::from_value(value).ok();
        assert_eq!(back, Some(event));
    }
}
