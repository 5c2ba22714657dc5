//! Dedupe key derivation.
//!
//! A [`DedupeKey`] identifies "the same logical event". It is a SHA-256
//! digest over the event type, actor, subject, task, canonical payload and
//! an optional caller-supplied correlation reference (`source_ref`).
//! Folding the reference in lets two otherwise identical events emitted in
//! the same logical tick be told apart.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::enums::EventType;
use crate::payload::Payload;

/// Domain separator so ledger digests never collide with other uses of
/// SHA-256 over the same fields.
const DEDUPE_DOMAIN: &[u8] = b"ledgerd/dedupe/v1";

/// The fields that define the logical identity of an event.
#[derive(Debug, Clone, Copy)]
pub struct DedupeInputs<'a> {
    /// Event type.
    pub event_type: &'a EventType,
    /// Actor that caused the event.
    pub actor_id: &'a str,
    /// Primary subject, if any.
    pub subject_id: Option<&'a str>,
    /// Correlation task, if any.
    pub task_id: Option<&'a str>,
    /// Event payload.
    pub payload: &'a Payload,
    /// Caller-supplied correlation reference, if any.
    pub source_ref: Option<&'a str>,
}

/// A derived hash identifying one logical event. Unique across the ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupeKey(String);

impl DedupeKey {
    /// Compute the key for the given inputs. Deterministic across runs.
    pub fn compute(inputs: &DedupeInputs<'_>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DEDUPE_DOMAIN);
        absorb(&mut hasher, Some(inputs.event_type.as_str()));
        absorb(&mut hasher, Some(inputs.actor_id));
        absorb(&mut hasher, inputs.subject_id);
        absorb(&mut hasher, inputs.task_id);
        absorb(&mut hasher, Some(&inputs.payload.canonical_json()));
        absorb(&mut hasher, inputs.source_ref);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a caller-supplied key verbatim.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feed one optional field into the hasher, length-prefixed so adjacent
/// fields cannot run into each other.
fn absorb(hasher: &mut Sha256, field: Option<&str>) {
    match field {
        None => hasher.update([0_u8]),
        Some(value) => {
            let len = u64::try_from(value.len()).unwrap_or(u64::MAX);
            hasher.update([1_u8]);
            hasher.update(len.to_be_bytes());
            hasher.update(value.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(
        event_type: &EventType,
        subject_id: Option<&str>,
        payload: &Payload,
        source_ref: Option<&str>,
    ) -> DedupeKey {
        DedupeKey::compute(&DedupeInputs {
            event_type,
            actor_id: "founder_0",
            subject_id,
            task_id: None,
            payload,
            source_ref,
        })
    }

    #[test]
    fn same_inputs_same_key() {
        let et = EventType::from("entity_created");
        let payload = Payload::new().with("name", "Alpha");
        assert_eq!(
            key(&et, Some("entity_1"), &payload, None),
            key(&et, Some("entity_1"), &payload, None)
        );
    }

    #[test]
    fn source_ref_distinguishes_repeats() {
        let et = EventType::from("payout");
        let payload = Payload::new().with("amount", 5);
        let a = key(&et, None, &payload, Some("tick-7#0"));
        let b = key(&et, None, &payload, Some("tick-7#1"));
        let none = key(&et, None, &payload, None);
        assert_ne!(a, b);
        assert_ne!(a, none);
    }

    #[test]
    fn absent_and_empty_fields_differ() {
        let et = EventType::from("entity_created");
        let payload = Payload::new();
        assert_ne!(
            key(&et, None, &payload, None),
            key(&et, Some(""), &payload, None)
        );
    }

    #[test]
    fn payload_changes_key() {
        let et = EventType::from("entity_created");
        let a = key(&et, None, &Payload::new().with("name", "Alpha"), None);
        let b = key(&et, None, &Payload::new().with("name", "Beta"), None);
        assert_ne!(a, b);
    }

    #[test]
    fn key_is_hex_sha256() {
        let k = key(&EventType::Heartbeat, None, &Payload::new(), None);
        assert_eq!(k.as_str().len(), 64);
        assert!(k.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
