//! The dedupe registry: which logical events have already been applied.
//!
//! Held in memory and rebuilt on open by scanning the durable log once.
//! The log carries every event's `dedupe_key`, so the log itself is the
//! persisted form of the registry. Entries are never removed.

use std::collections::HashMap;

use ledgerd_types::{DedupeKey, Event, EventId};

/// Map from dedupe key to the event that first claimed it.
#[derive(Debug, Default)]
pub struct DedupeRegistry {
    entries: HashMap<DedupeKey, EventId>,
}

impl DedupeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from replayed log events.
    ///
    /// If the log somehow holds two events under one key, the first (lowest
    /// sequence id) wins and the collision is logged.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut registry = Self::new();
        for event in events {
            if !registry.register(event.dedupe_key.clone(), event.event_id) {
                tracing::warn!(
                    sequence_id = event.sequence_id,
                    dedupe_key = %event.dedupe_key,
                    "Duplicate dedupe key in event log; keeping first occurrence"
                );
            }
        }
        registry
    }

    /// Return the event id that claimed `key`, if any.
    pub fn lookup(&self, key: &DedupeKey) -> Option<EventId> {
        self.entries.get(key).copied()
    }

    /// Claim `key` for `event_id`. Returns `false` (and changes nothing) if
    /// the key was already claimed.
    pub fn register(&mut self, key: DedupeKey, event_id: EventId) -> bool {
        match self.entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(event_id);
                true
            }
        }
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has been registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ledgerd_types::EventDraft;

    use super::*;

    #[test]
    fn first_claim_wins() {
        let mut registry = DedupeRegistry::new();
        let key = DedupeKey::from_raw("k");
        let first = EventId::new();

        assert!(registry.register(key.clone(), first));
        assert!(!registry.register(key.clone(), EventId::new()));
        assert_eq!(registry.lookup(&key), Some(first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rebuilt_from_events() {
        let events: Vec<Event> = (1..=3_u64)
            .map(|seq| {
                let draft = EventDraft::new("heartbeat", "daemon").source_ref(seq.to_string());
                let key = draft.resolve_dedupe_key();
                draft.into_event(EventId::new(), seq, Utc::now(), key)
            })
            .collect();

        let registry = DedupeRegistry::from_events(&events);
        assert_eq!(registry.len(), 3);
        for event in &events {
            assert_eq!(registry.lookup(&event.dedupe_key), Some(event.event_id));
        }
    }
}
