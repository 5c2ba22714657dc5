//! The event ledger: the single write path for every event.
//!
//! All appends go through one critical section guarded by an async
//! mutex. Inside it an event is deduplicated, sequenced, timestamped,
//! written to the log (authoritative), projected into the index (derived),
//! registered for dedupe, and queued for listeners and subscribers.
//! Sequence ids are therefore gap-free and in commit order.
//!
//! Listeners run on a separate dispatcher task fed in sequence order, so
//! they observe events in that order without holding up the writer.
//!
//! The critical section runs on its own task so that dropping an emit
//! future cannot interrupt a half-finished commit.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ledgerd_store::{
    DedupeRegistry, EventIndex, EventLog, EventQuery, RecoveryReport, StoreError, StoreLayout,
    open_store, reconcile_index,
};
use ledgerd_types::{Event, EventDraft, EventId, EventType, Payload};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{EmitError, QueryError};
use crate::listener::{Dispatch, EventListener, ListenerId, ListenerRegistry, run_dispatcher};

/// Actor recorded on events emitted through [`Ledger::emit_custom_event`].
pub const SYSTEM_ACTOR: &str = "system";

/// Subject recorded on events emitted through [`Ledger::emit_custom_event`].
pub const GLOBAL_SUBJECT: &str = "global";

/// Result of a successful emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// The event was appended.
    Committed {
        /// Identifier of the new event.
        event_id: EventId,
        /// Its position in the total order.
        sequence_id: u64,
    },
    /// An event with the same dedupe key already exists; nothing was written.
    Duplicate {
        /// Identifier of the existing event.
        event_id: EventId,
    },
}

impl EmitOutcome {
    /// The new or existing event id.
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::Committed { event_id, .. } | Self::Duplicate { event_id } => *event_id,
        }
    }

    /// Sequence id of a newly committed event.
    pub const fn sequence_id(&self) -> Option<u64> {
        match self {
            Self::Committed { sequence_id, .. } => Some(*sequence_id),
            Self::Duplicate { .. } => None,
        }
    }

    /// Whether the emit was a no-op.
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    /// Human-readable summary.
    pub const fn message(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "event committed",
            Self::Duplicate { .. } => "duplicate event, not re-applied",
        }
    }
}

/// Outcome of comparing the log's event set with the index's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParityResult {
    /// Both sinks hold exactly the same events.
    Consistent {
        /// Number of events in each sink.
        events: u64,
    },
    /// The sinks disagree.
    Divergent {
        /// Events present in the log but missing from the index.
        log_only: Vec<EventId>,
        /// Events present in the index but absent from the log.
        index_only: Vec<EventId>,
    },
}

impl ParityResult {
    /// Whether the sinks agree.
    pub const fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent { .. })
    }
}

/// Tunables for [`Ledger::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerOptions {
    /// Listener calls slower than this are logged.
    pub listener_warn_after: Duration,
    /// Listener calls still running after this are abandoned.
    pub listener_timeout: Duration,
    /// Per-subscriber buffer of the broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            listener_warn_after: Duration::from_secs(1),
            listener_timeout: Duration::from_secs(5),
            broadcast_capacity: 1_024,
        }
    }
}

/// Point-in-time counters of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStatus {
    /// Events in the log.
    pub total_events: u64,
    /// Highest committed sequence id, 0 when empty.
    pub last_sequence_id: u64,
    /// The last log append failed.
    pub degraded: bool,
    /// The index is known to be missing committed events.
    pub index_stale: bool,
    /// Most recent failure message. Cleared only by a restart.
    pub last_error: Option<String>,
    /// Registered listeners.
    pub listener_count: usize,
}

/// State owned by the writer critical section.
#[derive(Debug)]
struct Writer {
    log: EventLog,
    registry: DedupeRegistry,
    last_sequence_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
    /// Feeds the dispatcher task. Taken on close.
    dispatch_tx: Option<mpsc::UnboundedSender<Dispatch>>,
    closed: bool,
}

/// Counters readable without taking the writer lock.
#[derive(Debug, Default)]
struct Stats {
    total_events: AtomicU64,
    last_sequence_id: AtomicU64,
    degraded: AtomicBool,
    index_stale: AtomicBool,
    last_error: StdMutex<Option<String>>,
}

impl Stats {
    fn record_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
struct Inner {
    layout: StoreLayout,
    writer: Mutex<Writer>,
    index: EventIndex,
    listeners: Arc<ListenerRegistry>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    events_tx: broadcast::Sender<Event>,
    stats: Arc<Stats>,
    recovery: RecoveryReport,
}

/// Handle to an open ledger. Cheap to clone; clones share one writer.
#[derive(Debug, Clone)]
pub struct Ledger {
    inner: Arc<Inner>,
}

impl Ledger {
    /// Open (or create) the ledger in `layout`, running recovery first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if recovery fails. Startup must not continue
    /// in that case.
    pub async fn open(layout: StoreLayout, options: LedgerOptions) -> Result<Self, StoreError> {
        let recovered = open_store(&layout).await?;
        let (events_tx, _) = broadcast::channel(options.broadcast_capacity.max(1));

        let stats = Arc::new(Stats::default());
        stats
            .total_events
            .store(recovered.report.events_replayed, Ordering::Relaxed);
        stats
            .last_sequence_id
            .store(recovered.last_sequence_id, Ordering::Relaxed);

        let listeners = Arc::new(ListenerRegistry::new(
            options.listener_warn_after,
            options.listener_timeout,
        ));
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let failures = Arc::clone(&stats);
        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&listeners),
            dispatch_rx,
            move |failure| failures.record_error(format!("listener failed: {failure}")),
        ));

        let writer = Writer {
            log: recovered.log,
            registry: recovered.registry,
            last_sequence_id: recovered.last_sequence_id,
            last_timestamp: recovered.last_timestamp,
            dispatch_tx: Some(dispatch_tx),
            closed: false,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                layout,
                writer: Mutex::new(writer),
                index: recovered.index,
                listeners,
                dispatcher: StdMutex::new(Some(dispatcher)),
                events_tx,
                stats,
                recovery: recovered.report,
            }),
        })
    }

    /// Submit an event.
    ///
    /// Returns [`EmitOutcome::Duplicate`] without writing anything if an
    /// event with the same dedupe key was already committed.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::Validation`] if the draft is malformed,
    /// [`EmitError::Persistence`] if the log append fails, and
    /// [`EmitError::Closed`] once [`Ledger::close`] has run. An index
    /// failure is not an error: the event is durable in the log and the
    /// index is flagged stale.
    pub async fn emit(&self, draft: EventDraft) -> Result<EmitOutcome, EmitError> {
        draft.validate()?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.commit(draft).await })
            .await
            .map_err(|e| EmitError::Aborted(e.to_string()))?
    }

    /// Emit an application event under the `system` actor and `global`
    /// subject.
    ///
    /// # Errors
    ///
    /// See [`Ledger::emit`].
    pub async fn emit_custom_event(
        &self,
        event_type: impl Into<EventType>,
        payload: Payload,
    ) -> Result<EmitOutcome, EmitError> {
        let draft = EventDraft::new(event_type, SYSTEM_ACTOR)
            .subject(GLOBAL_SUBJECT)
            .payload(payload);
        self.emit(draft).await
    }

    /// Filtered read from the index, ascending by sequence id.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if the index cannot be read.
    pub async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, QueryError> {
        Ok(self.inner.index.query(query).await?)
    }

    /// Register a synchronous listener, called for every committed event
    /// on the dispatcher task. Use [`Ledger::wait_for_listeners`] to wait
    /// for delivery.
    pub fn add_listener<L>(&self, listener: L) -> ListenerId
    where
        L: EventListener + 'static,
    {
        self.inner.listeners.add(Arc::new(listener))
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Wait until every event committed before this call has been offered
    /// to every listener. Returns immediately once the ledger is closed.
    pub async fn wait_for_listeners(&self) {
        let (done, delivered) = oneshot::channel();
        let queued = {
            let writer = self.inner.writer.lock().await;
            writer
                .dispatch_tx
                .as_ref()
                .is_some_and(|tx| tx.send(Dispatch::Barrier(done)).is_ok())
        };
        if queued {
            // An error means the dispatcher exited; nothing is left to wait for.
            let _ = delivered.await;
        }
    }

    /// Asynchronous stream of committed events. Slow receivers lag rather
    /// than stall the writer.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    /// Make every committed event durable in both sinks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log sync or index checkpoint fails.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let mut writer = self.inner.writer.lock().await;
        if writer.closed {
            return Ok(());
        }
        writer.log.sync().await?;
        self.inner.index.checkpoint().await?;
        drop(writer);
        Ok(())
    }

    /// Rebuild missing index rows from the log and prune rows the log does
    /// not hold. Clears the stale flag on success.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log cannot be read or the index
    /// cannot be written.
    pub async fn reindex(&self) -> Result<u64, StoreError> {
        let writer = self.inner.writer.lock().await;
        let events = EventLog::read_all(writer.log.path()).await?;
        let (restored, pruned) = reconcile_index(&self.inner.index, &events).await?;
        self.inner.stats.index_stale.store(false, Ordering::Release);
        drop(writer);
        info!(restored, pruned, "Index reconciled with event log");
        Ok(restored)
    }

    /// Compare the log's event ids with the index's at a quiescent point.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if either sink cannot be read.
    pub async fn verify_parity(&self) -> Result<ParityResult, StoreError> {
        let writer = self.inner.writer.lock().await;
        let logged: BTreeSet<EventId> = EventLog::read_all(writer.log.path())
            .await?
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        let indexed = self.inner.index.event_ids().await?;
        drop(writer);

        if logged == indexed {
            return Ok(ParityResult::Consistent {
                events: u64::try_from(logged.len()).unwrap_or(u64::MAX),
            });
        }
        let log_only: Vec<EventId> = logged.difference(&indexed).copied().collect();
        let index_only: Vec<EventId> = indexed.difference(&logged).copied().collect();
        warn!(
            log_only = log_only.len(),
            index_only = index_only.len(),
            "Event log and index have diverged"
        );
        Ok(ParityResult::Divergent {
            log_only,
            index_only,
        })
    }

    /// Record a failure message for health reporting.
    pub fn record_error(&self, message: impl Into<String>) {
        self.inner.stats.record_error(message.into());
    }

    /// Current counters.
    pub fn status(&self) -> LedgerStatus {
        let stats = &self.inner.stats;
        LedgerStatus {
            total_events: stats.total_events.load(Ordering::Acquire),
            last_sequence_id: stats.last_sequence_id.load(Ordering::Acquire),
            degraded: stats.degraded.load(Ordering::Acquire),
            index_stale: stats.index_stale.load(Ordering::Acquire),
            last_error: stats.last_error(),
            listener_count: self.inner.listeners.len(),
        }
    }

    /// What recovery found when the ledger was opened.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovery
    }

    /// The data directory.
    pub fn data_dir(&self) -> &std::path::Path {
        &self.inner.layout.data_dir
    }

    /// Stop accepting emits, flush both sinks, drain the listener queue and
    /// close the index pool. Later emits on any clone fail with
    /// [`EmitError::Closed`]. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the final flush fails. The ledger is
    /// closed regardless.
    pub async fn close(&self) -> Result<(), StoreError> {
        let mut writer = self.inner.writer.lock().await;
        if writer.closed {
            return Ok(());
        }
        writer.closed = true;
        let dispatch_tx = writer.dispatch_tx.take();
        let synced = writer.log.sync().await;
        let checkpointed = self.inner.index.checkpoint().await;
        drop(writer);

        // Dropping the last sender lets the dispatcher finish its queue and exit.
        drop(dispatch_tx);
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            if let Err(err) = handle.await {
                error!(error = %err, "Listener dispatcher ended abnormally");
            }
        }

        self.inner.index.close().await;
        debug!(data_dir = %self.inner.layout.data_dir.display(), "Ledger closed");
        synced?;
        checkpointed
    }

    #[cfg(test)]
    async fn fail_next_appends(&self, count: u32) {
        self.inner.writer.lock().await.log.fail_next_appends(count);
    }
}

impl Inner {
    /// The write critical section.
    async fn commit(&self, draft: EventDraft) -> Result<EmitOutcome, EmitError> {
        let dedupe_key = draft.resolve_dedupe_key();
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(EmitError::Closed);
        }

        if let Some(event_id) = writer.registry.lookup(&dedupe_key) {
            debug!(
                event_type = %draft.event_type,
                event_id = %event_id,
                "Duplicate emit ignored"
            );
            return Ok(EmitOutcome::Duplicate { event_id });
        }

        let sequence_id = writer
            .last_sequence_id
            .checked_add(1)
            .ok_or(EmitError::SequenceExhausted(writer.last_sequence_id))?;
        let now = Utc::now();
        let timestamp = writer.last_timestamp.map_or(now, |last| last.max(now));
        let event = draft.into_event(EventId::new(), sequence_id, timestamp, dedupe_key);

        // 1. Log: authoritative. Failure means nothing happened.
        if let Err(err) = writer.log.append(&event).await {
            error!(
                sequence_id,
                event_type = %event.event_type,
                error = %err,
                poisoned = writer.log.is_poisoned(),
                "Event log append failed"
            );
            self.stats.degraded.store(true, Ordering::Release);
            self.stats.record_error(format!("log append failed: {err}"));
            return Err(EmitError::Persistence(err));
        }
        writer.last_sequence_id = sequence_id;
        writer.last_timestamp = Some(timestamp);
        self.stats.degraded.store(false, Ordering::Release);
        self.stats.total_events.fetch_add(1, Ordering::AcqRel);
        self.stats
            .last_sequence_id
            .store(sequence_id, Ordering::Release);

        // 2. Index: derived. Failure leaves the event durable but unindexed.
        if let Err(err) = self.index.insert(&event).await {
            warn!(
                sequence_id,
                error = %err,
                "Index insert failed; event is in the log but not yet queryable"
            );
            self.stats.index_stale.store(true, Ordering::Release);
            self.stats
                .record_error(format!("index insert failed for sequence {sequence_id}: {err}"));
        }

        // 3. Dedupe registry.
        writer
            .registry
            .register(event.dedupe_key.clone(), event.event_id);

        debug!(
            sequence_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Event committed"
        );

        // 4. Fan-out. Queued under the lock so delivery follows sequence
        // order; listeners themselves run after the lock is released.
        let event_id = event.event_id;
        let event = Arc::new(event);
        let queued = writer
            .dispatch_tx
            .as_ref()
            .is_some_and(|tx| tx.send(Dispatch::Event(Arc::clone(&event))).is_ok());
        if !queued {
            warn!(sequence_id, "Listener dispatcher is gone; event not delivered");
        }
        // No subscribers is not an error.
        let _ = self.events_tx.send(Event::clone(&event));
        drop(writer);

        Ok(EmitOutcome::Committed {
            event_id,
            sequence_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::listener::ListenerError;

    async fn open(dir: &Path) -> Ledger {
        Ledger::open(StoreLayout::new(dir), LedgerOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn emit_assigns_contiguous_sequence_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path()).await;

        for expected in 1..=3_u64 {
            let outcome = ledger
                .emit(EventDraft::new("tick", "clock").source_ref(format!("t{expected}")))
                .await
                .unwrap();
            assert_eq!(outcome.sequence_id(), Some(expected));
        }
        let status = ledger.status();
        assert_eq!(status.total_events, 3);
        assert_eq!(status.last_sequence_id, 3);
        assert!(!status.degraded);
    }

    #[tokio::test]
    async fn duplicate_returns_original_id() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path()).await;
        let draft = EventDraft::new("entity_created", "founder_0").subject("entity_1");

        let first = ledger.emit(draft.clone()).await.unwrap();
        let second = ledger.emit(draft).await.unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.message(), "duplicate event, not re-applied");
        assert_eq!(first.event_id(), second.event_id());
        assert_eq!(ledger.status().total_events, 1);
    }

    #[tokio::test]
    async fn validation_failure_consumes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path()).await;

        let err = ledger.emit(EventDraft::new("", "actor")).await.unwrap_err();
        assert!(matches!(err, EmitError::Validation(_)));

        let ok = ledger.emit(EventDraft::new("x", "actor")).await.unwrap();
        assert_eq!(ok.sequence_id(), Some(1));
    }

    #[tokio::test]
    async fn custom_event_uses_system_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path()).await;
        ledger
            .emit_custom_event("season_changed", Payload::new().with("season", "winter"))
            .await
            .unwrap();

        let events = ledger.query_events(&EventQuery::new()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor_id, SYSTEM_ACTOR);
        assert_eq!(events[0].subject_id.as_deref(), Some(GLOBAL_SUBJECT));
        assert_eq!(events[0].payload.get_str("season"), Some("winter"));
    }

    #[tokio::test]
    async fn timestamps_never_decrease() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path()).await;
        for i in 0..20 {
            ledger
                .emit(EventDraft::new("tick", "clock").source_ref(format!("{i}")))
                .await
                .unwrap();
        }
        let events = ledger
            .query_events(&EventQuery::new().limit(100))
            .await
            .unwrap();
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn failed_append_degrades_without_consuming_a_sequence_id() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path()).await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ledger.add_listener(move |e: &Event| -> Result<(), ListenerError> {
            sink.lock().unwrap().push(e.sequence_id);
            Ok(())
        });
        ledger.emit(EventDraft::new("tick", "clock").source_ref("1")).await.unwrap();

        ledger.fail_next_appends(1).await;
        let err = ledger
            .emit(EventDraft::new("tick", "clock").source_ref("2"))
            .await
            .unwrap_err();
        assert!(matches!(err, EmitError::Persistence(_)));
        let status = ledger.status();
        assert!(status.degraded);
        assert_eq!(status.last_sequence_id, 1);
        assert_eq!(status.total_events, 1);
        assert!(status.last_error.unwrap().contains("log append failed"));
        ledger.wait_for_listeners().await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        // The same draft was never committed, so it is not a duplicate.
        let retried = ledger
            .emit(EventDraft::new("tick", "clock").source_ref("2"))
            .await
            .unwrap();
        assert_eq!(retried.sequence_id(), Some(2));
        assert!(!ledger.status().degraded);
        ledger.wait_for_listeners().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        let logged = EventLog::read_all(&StoreLayout::new(dir.path()).log_path)
            .await
            .unwrap();
        assert_eq!(logged.len(), 2);
    }

    #[tokio::test]
    async fn closed_ledger_rejects_emits_on_every_clone() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path()).await;
        let other = ledger.clone();
        ledger.emit(EventDraft::new("tick", "clock")).await.unwrap();

        ledger.close().await.unwrap();
        ledger.close().await.unwrap();
        assert!(matches!(
            other.emit(EventDraft::new("tick", "clock").source_ref("late")).await,
            Err(EmitError::Closed)
        ));
        assert!(other.flush().await.is_ok());
        other.wait_for_listeners().await;
        assert_eq!(other.status().last_sequence_id, 1);
    }
}
