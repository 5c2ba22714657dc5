//! Event type tags.
//!
//! The daemon itself only knows three event types. Everything else is a
//! domain-specific tag chosen by the simulation and carried verbatim as
//! [`EventType::Custom`], so new kinds of events never require a rebuild
//! of the ledger.

use serde::{Deserialize, Serialize};

/// The kind of occurrence an event records.
///
/// Serialized as a plain string. Construct through [`From<&str>`] or
/// [`From<String>`] so well-known names always map to their dedicated
/// variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Periodic liveness signal emitted by the heartbeat controller.
    Heartbeat,
    /// The daemon started its lifecycle (emitted before the first heartbeat).
    DaemonStarted,
    /// The daemon stopped its lifecycle.
    DaemonStopped,
    /// Any domain-specific event type (e.g. `entity_created`).
    Custom(String),
}

impl EventType {
    /// Wire name of [`EventType::Heartbeat`].
    pub const HEARTBEAT: &'static str = "heartbeat";
    /// Wire name of [`EventType::DaemonStarted`].
    pub const DAEMON_STARTED: &'static str = "daemon_started";
    /// Wire name of [`EventType::DaemonStopped`].
    pub const DAEMON_STOPPED: &'static str = "daemon_stopped";

    /// Return the wire name of this event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => Self::HEARTBEAT,
            Self::DaemonStarted => Self::DAEMON_STARTED,
            Self::DaemonStopped => Self::DAEMON_STOPPED,
            Self::Custom(name) => name,
        }
    }

    /// Whether this type is emitted by the daemon itself rather than a
    /// simulation component.
    pub const fn is_system(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// Whether the wire name is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        match name.as_str() {
            Self::HEARTBEAT => Self::Heartbeat,
            Self::DAEMON_STARTED => Self::DaemonStarted,
            Self::DAEMON_STOPPED => Self::DaemonStopped,
            _ => Self::Custom(name),
        }
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::from(name.to_owned())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Custom(name) => name,
            other => other.as_str().to_owned(),
        }
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_names_map_to_variants() {
        assert_eq!(EventType::from("heartbeat"), EventType::Heartbeat);
        assert_eq!(EventType::from("daemon_started"), EventType::DaemonStarted);
        assert_eq!(EventType::from("daemon_stopped"), EventType::DaemonStopped);
        assert_eq!(
            EventType::from("entity_created"),
            EventType::Custom(String::from("entity_created"))
        );
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&EventType::DaemonStarted).unwrap_or_default();
        assert_eq!(json, "\"daemon_started\"");

        let parsed: Option<EventType> = serde_json::from_str("\"task_state_changed\"").ok();
        assert_eq!(
            parsed,
            Some(EventType::Custom(String::from("task_state_changed")))
        );
    }

    #[test]
    fn system_and_blank_detection() {
        assert!(EventType::Heartbeat.is_system());
        assert!(!EventType::from("payout").is_system());
        assert!(EventType::from("  ").is_blank());
        assert!(!EventType::Heartbeat.is_blank());
    }
}
