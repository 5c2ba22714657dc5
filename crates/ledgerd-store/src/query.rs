//! Filtered event queries against the index.

use chrono::{DateTime, Utc};
use ledgerd_types::EventType;

/// Window size used when a query does not set one.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Upper bound on the window size of a single query.
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Filters for [`EventIndex::query`](crate::EventIndex::query).
///
/// All filters are conjunctive. The result is the most recent `limit`
/// matching events, returned in ascending `sequence_id` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// Only events of this type.
    pub event_type: Option<EventType>,
    /// Only events about this subject.
    pub subject_id: Option<String>,
    /// Only events caused by this actor.
    pub actor_id: Option<String>,
    /// Only events correlated with this task.
    pub task_id: Option<String>,
    /// Only events at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only events strictly before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of events returned.
    pub limit: usize,
}

impl EventQuery {
    /// A query matching every event, limited to [`DEFAULT_QUERY_LIMIT`].
    pub const fn new() -> Self {
        Self {
            event_type: None,
            subject_id: None,
            actor_id: None,
            task_id: None,
            since: None,
            until: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    /// Filter by event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<EventType>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Filter by subject.
    #[must_use]
    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Filter by actor.
    #[must_use]
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Filter by task.
    #[must_use]
    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Only events at or after `since`.
    #[must_use]
    pub const fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Only events strictly before `until`.
    #[must_use]
    pub const fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Set the window size.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// The window size actually applied.
    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_QUERY_LIMIT)
    }
}

impl Default for EventQuery {
    fn default() -> Self {
        Self::new()
    }
}
