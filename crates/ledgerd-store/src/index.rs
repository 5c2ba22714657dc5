//! The `SQLite` secondary index: fast filtered lookup over the log.
//!
//! The index mirrors every log line as a row with unique constraints on
//! `event_id`, `sequence_id` and `dedupe_key`, and secondary indexes on
//! `event_type`, `actor_id`, `subject_id`, `task_id` and time. It is a
//! derived projection: anything here can be rebuilt from the log.
//!
//! Uses [`sqlx`] with runtime query construction (not compile-time
//! checked) so builds never need a live database. The database runs in
//! WAL mode, so readers see a consistent snapshot while the writer
//! appends.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use ledgerd_types::{DedupeKey, Event, EventId, EventType, Payload};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite};

use crate::error::StoreError;
use crate::query::EventQuery;

/// File name of the index inside the data directory.
pub const INDEX_FILE_NAME: &str = "index.db";

/// Default maximum number of connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// How long a connection waits on a locked database before failing.
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Columns selected for every event read, in [`EventRow`] order.
const EVENT_COLUMNS: &str = "sequence_id, event_id, event_type, actor_id, subject_id, task_id, payload, timestamp, dedupe_key";

/// Connection pool handle to the `SQLite` index.
#[derive(Debug, Clone)]
pub struct EventIndex {
    pool: SqlitePool,
}

impl EventIndex {
    /// Open (or create) the index at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the database cannot be opened, or
    /// [`StoreError::Migration`] if the schema cannot be applied.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(path = %path.display(), "Event index opened");
        Ok(Self { pool })
    }

    /// Insert one event. Fails on any unique-constraint conflict.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the insert fails.
    pub async fn insert(&self, event: &Event) -> Result<(), StoreError> {
        let row = EncodedEvent::new(event)?;
        sqlx::query(
            r"INSERT INTO events (sequence_id, event_id, event_type, actor_id, subject_id, task_id, payload, timestamp, timestamp_us, dedupe_key)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.sequence_id)
        .bind(row.event_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_id.as_str())
        .bind(event.subject_id.as_deref())
        .bind(event.task_id.as_deref())
        .bind(row.payload)
        .bind(row.timestamp)
        .bind(row.timestamp_us)
        .bind(event.dedupe_key.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert every event not yet present, in one transaction.
    ///
    /// Returns the number of rows actually added.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the transaction fails.
    pub async fn insert_missing(&self, events: &[Event]) -> Result<u64, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut added: u64 = 0;
        for event in events {
            let row = EncodedEvent::new(event)?;
            let result = sqlx::query(
                r"INSERT OR IGNORE INTO events (sequence_id, event_id, event_type, actor_id, subject_id, task_id, payload, timestamp, timestamp_us, dedupe_key)
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.sequence_id)
            .bind(row.event_id)
            .bind(event.event_type.as_str())
            .bind(event.actor_id.as_str())
            .bind(event.subject_id.as_deref())
            .bind(event.task_id.as_deref())
            .bind(row.payload)
            .bind(row.timestamp)
            .bind(row.timestamp_us)
            .bind(event.dedupe_key.as_str())
            .execute(&mut *tx)
            .await?;
            added = added.saturating_add(result.rows_affected());
        }
        tx.commit().await?;

        tracing::debug!(added, scanned = events.len(), "Index catch-up complete");
        Ok(added)
    }

    /// Delete rows past `sequence_id`. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the delete fails.
    pub async fn delete_after(&self, sequence_id: u64) -> Result<u64, StoreError> {
        let bound = to_db_sequence(sequence_id)?;
        let result = sqlx::query("DELETE FROM events WHERE sequence_id > ?")
            .bind(bound)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Highest indexed sequence id, or 0 when empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the query fails.
    pub async fn max_sequence_id(&self) -> Result<u64, StoreError> {
        let max = sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(sequence_id), 0) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(max).unwrap_or(0))
    }

    /// Number of indexed events.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the query fails.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Every indexed event id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the query fails, or
    /// [`StoreError::CorruptRow`] if a stored id is not a UUID.
    pub async fn event_ids(&self) -> Result<BTreeSet<EventId>, StoreError> {
        let rows =
            sqlx::query_as::<_, (i64, String)>("SELECT sequence_id, event_id FROM events ORDER BY sequence_id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(sequence_id, id)| {
                id.parse::<EventId>()
                    .map_err(|e| StoreError::CorruptRow {
                        sequence_id,
                        reason: format!("invalid event_id: {e}"),
                    })
            })
            .collect()
    }

    /// Fetch one event by sequence id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the row is corrupt.
    pub async fn get(&self, sequence_id: u64) -> Result<Option<Event>, StoreError> {
        let bound = to_db_sequence(sequence_id)?;
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE sequence_id = ?");
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(bound)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Event::try_from).transpose()
    }

    /// Run a filtered query.
    ///
    /// Returns the most recent `limit` matches, ordered by ascending
    /// `sequence_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    pub async fn query(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let limit = query.effective_limit();
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1 = 1"));

        if let Some(event_type) = &query.event_type {
            builder
                .push(" AND event_type = ")
                .push_bind(event_type.as_str().to_owned());
        }
        if let Some(subject_id) = &query.subject_id {
            builder.push(" AND subject_id = ").push_bind(subject_id.clone());
        }
        if let Some(actor_id) = &query.actor_id {
            builder.push(" AND actor_id = ").push_bind(actor_id.clone());
        }
        if let Some(task_id) = &query.task_id {
            builder.push(" AND task_id = ").push_bind(task_id.clone());
        }
        if let Some(since) = query.since {
            builder
                .push(" AND timestamp_us >= ")
                .push_bind(since.timestamp_micros());
        }
        if let Some(until) = query.until {
            builder
                .push(" AND timestamp_us < ")
                .push_bind(until.timestamp_micros());
        }
        builder
            .push(" ORDER BY sequence_id DESC LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = builder
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().rev().map(Event::try_from).collect()
    }

    /// Fold the WAL back into the main database file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the checkpoint fails.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close all connections in the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("Event index closed");
    }
}

/// A row from the `events` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Position in the total order.
    pub sequence_id: i64,
    /// Event UUID as text.
    pub event_id: String,
    /// Event type wire name.
    pub event_type: String,
    /// Actor id.
    pub actor_id: String,
    /// Subject id, if any.
    pub subject_id: Option<String>,
    /// Task id, if any.
    pub task_id: Option<String>,
    /// Payload JSON.
    pub payload: String,
    /// RFC 3339 timestamp with nanosecond precision.
    pub timestamp: String,
    /// Dedupe key.
    pub dedupe_key: String,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let raw_sequence = row.sequence_id;
        let corrupt = move |reason: String| StoreError::CorruptRow {
            sequence_id: raw_sequence,
            reason,
        };

        let sequence_id = u64::try_from(row.sequence_id)
            .map_err(|e| corrupt(format!("invalid sequence_id: {e}")))?;
        let event_id = row
            .event_id
            .parse::<EventId>()
            .map_err(|e| corrupt(format!("invalid event_id: {e}")))?;
        let payload: Payload = serde_json::from_str(&row.payload)
            .map_err(|e| corrupt(format!("invalid payload: {e}")))?;
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|e| corrupt(format!("invalid timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(Self {
            event_id,
            sequence_id,
            event_type: EventType::from(row.event_type),
            actor_id: row.actor_id,
            subject_id: row.subject_id,
            task_id: row.task_id,
            payload,
            timestamp,
            dedupe_key: DedupeKey::from_raw(row.dedupe_key),
        })
    }
}

/// Column values of an event that need conversion before binding.
struct EncodedEvent {
    sequence_id: i64,
    event_id: String,
    payload: String,
    timestamp: String,
    timestamp_us: i64,
}

impl EncodedEvent {
    fn new(event: &Event) -> Result<Self, StoreError> {
        Ok(Self {
            sequence_id: to_db_sequence(event.sequence_id)?,
            event_id: event.event_id.to_string(),
            payload: serde_json::to_string(&event.payload)?,
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            timestamp_us: event.timestamp.timestamp_micros(),
        })
    }
}

fn to_db_sequence(sequence_id: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence_id).map_err(|source| StoreError::SequenceOverflow {
        sequence_id,
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use ledgerd_types::EventDraft;

    use super::*;

    async fn open_temp() -> (tempfile::TempDir, EventIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = EventIndex::open(&dir.path().join(INDEX_FILE_NAME))
            .await
            .unwrap();
        (dir, index)
    }

    fn make(seq: u64, event_type: &str, actor: &str, subject: Option<&str>) -> Event {
        let mut draft = EventDraft::new(event_type, actor)
            .payload(Payload::new().with("seq", seq));
        if let Some(subject) = subject {
            draft = draft.subject(subject);
        }
        let key = draft.resolve_dedupe_key();
        draft.into_event(EventId::new(), seq, Utc::now(), key)
    }

    #[tokio::test]
    async fn insert_and_read_back_exactly() {
        let (_dir, index) = open_temp().await;
        let event = make(1, "entity_created", "founder_0", Some("entity_1"));
        index.insert(&event).await.unwrap();

        let back = index.get(1).await.unwrap();
        assert_eq!(back, Some(event));
        assert_eq!(index.max_sequence_id().await.unwrap(), 1);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unique_constraints_reject_conflicts() {
        let (_dir, index) = open_temp().await;
        let event = make(1, "entity_created", "founder_0", None);
        index.insert(&event).await.unwrap();

        let mut same_seq = make(1, "entity_created", "founder_1", None);
        same_seq.dedupe_key = DedupeKey::from_raw("other");
        assert!(index.insert(&same_seq).await.is_err());

        let mut same_key = make(2, "entity_created", "founder_1", None);
        same_key.dedupe_key = event.dedupe_key.clone();
        assert!(index.insert(&same_key).await.is_err());

        let mut same_id = make(3, "entity_created", "founder_2", None);
        same_id.event_id = event.event_id;
        assert!(index.insert(&same_id).await.is_err());
    }

    #[tokio::test]
    async fn query_returns_latest_window_ascending() {
        let (_dir, index) = open_temp().await;
        for seq in 1..=10 {
            let event_type = if seq % 2 == 0 { "task_state_changed" } else { "heartbeat" };
            index
                .insert(&make(seq, event_type, "founder_0", Some("task_1")))
                .await
                .unwrap();
        }

        let result = index
            .query(&EventQuery::new().event_type("task_state_changed").limit(3))
            .await
            .unwrap();
        let seqs: Vec<u64> = result.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![6, 8, 10]);

        let none = index.query(&EventQuery::new().limit(0)).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn query_filters_by_actor_subject_and_time() {
        let (_dir, index) = open_temp().await;
        let mut early = make(1, "entity_created", "alice", Some("e1"));
        early.timestamp = Utc::now() - ChronoDuration::hours(1);
        let late = make(2, "entity_created", "bob", Some("e2"));
        index.insert(&early).await.unwrap();
        index.insert(&late).await.unwrap();

        let by_actor = index.query(&EventQuery::new().actor("alice")).await.unwrap();
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].sequence_id, 1);

        let by_subject = index.query(&EventQuery::new().subject("e2")).await.unwrap();
        assert_eq!(by_subject.len(), 1);
        assert_eq!(by_subject[0].sequence_id, 2);

        let recent = index
            .query(&EventQuery::new().since(Utc::now() - ChronoDuration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].sequence_id, 2);

        let old = index
            .query(&EventQuery::new().until(Utc::now() - ChronoDuration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].sequence_id, 1);
    }

    #[tokio::test]
    async fn insert_missing_and_delete_after() {
        let (_dir, index) = open_temp().await;
        let events: Vec<Event> = (1..=5)
            .map(|seq| make(seq, "heartbeat", "daemon", None))
            .collect();
        index.insert(&events[0]).await.unwrap();
        index.insert(&events[2]).await.unwrap();

        let added = index.insert_missing(&events).await.unwrap();
        assert_eq!(added, 3);
        assert_eq!(index.count().await.unwrap(), 5);

        let removed = index.delete_after(3).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.max_sequence_id().await.unwrap(), 3);

        let ids = index.event_ids().await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&events[1].event_id));
    }

    #[test]
    fn sequence_beyond_i64_is_rejected() {
        assert_eq!(to_db_sequence(42).unwrap(), 42);
        let err = to_db_sequence(u64::MAX).unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceOverflow {
                sequence_id: u64::MAX,
                ..
            }
        ));
        assert!(std::error::Error::source(&err).is_some());
    }
}
