//! Daemon lifecycle: open, start, stop, close.
//!
//! A [`Daemon`] wraps a [`Ledger`] with a heartbeat and lifecycle events.
//! `start` commits `daemon_started` before the first heartbeat; `stop`
//! halts the heartbeat, commits `daemon_stopped` and flushes both sinks.
//! Emits and queries are accepted whenever the daemon is open, running or
//! not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use ledgerd_store::{EventQuery, StoreLayout};
use ledgerd_types::{Event, EventDraft, EventType, Payload, SessionId};
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, EmitError, QueryError};
use crate::health::HealthSnapshot;
use crate::heartbeat::{DAEMON_ACTOR, HeartbeatController, HeartbeatStats};
use crate::ledger::{EmitOutcome, Ledger, LedgerOptions};
use crate::listener::{EventListener, ListenerId};

#[derive(Debug)]
struct Lifecycle {
    heartbeat: HeartbeatController,
    /// Start count within this session.
    epoch: u64,
}

/// The event ledger daemon.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    ledger: Ledger,
    session_id: SessionId,
    lifecycle: Mutex<Lifecycle>,
    heartbeat_stats: Arc<HeartbeatStats>,
    running: AtomicBool,
    started_at: StdMutex<Option<DateTime<Utc>>>,
}

impl Daemon {
    /// Recover the data directory and, if `auto_start` is set, start.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] for an invalid configuration,
    /// [`DaemonError::Recovery`] if the store cannot be recovered, and
    /// [`DaemonError::Lifecycle`] if auto-start fails.
    pub async fn open(config: DaemonConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let interval = config.heartbeat_interval()?;
        let options = LedgerOptions {
            listener_warn_after: config.listener_warn_after(),
            listener_timeout: config.listener_timeout(),
            broadcast_capacity: config.broadcast_capacity,
        };
        let ledger = Ledger::open(StoreLayout::new(&config.data_dir), options).await?;

        let session_id = SessionId::new();
        let heartbeat = HeartbeatController::new(interval, session_id);
        let heartbeat_stats = heartbeat.stats();

        info!(
            session_id = %session_id,
            data_dir = %config.data_dir.display(),
            heartbeat_interval_ms = interval.as_millis(),
            last_sequence_id = ledger.status().last_sequence_id,
            "Daemon opened"
        );

        let daemon = Self {
            config,
            ledger,
            session_id,
            lifecycle: Mutex::new(Lifecycle {
                heartbeat,
                epoch: 0,
            }),
            heartbeat_stats,
            running: AtomicBool::new(false),
            started_at: StdMutex::new(None),
        };

        if daemon.config.auto_start {
            daemon.start().await?;
        }
        Ok(daemon)
    }

    /// Commit `daemon_started`, then begin heartbeats. Returns `false` if
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Lifecycle`] if `daemon_started` cannot be
    /// committed; the daemon stays stopped.
    pub async fn start(&self) -> Result<bool, DaemonError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.heartbeat.is_running() {
            return Ok(false);
        }

        let epoch = lifecycle.epoch.saturating_add(1);
        self.emit_lifecycle(EventType::DaemonStarted, epoch, Payload::new())
            .await?;
        lifecycle.epoch = epoch;

        lifecycle.heartbeat.start(self.ledger.clone());
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.running.store(true, Ordering::Release);

        info!(session_id = %self.session_id, epoch, "Daemon started");
        Ok(true)
    }

    /// Halt heartbeats, commit `daemon_stopped`, and flush. Returns `false`
    /// if not running.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Lifecycle`] if `daemon_stopped` cannot be
    /// committed or [`DaemonError::Flush`] if the flush fails. The daemon is
    /// stopped either way.
    pub async fn stop(&self) -> Result<bool, DaemonError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.heartbeat.stop().await {
            return Ok(false);
        }

        let heartbeats = self.heartbeat_stats.count();
        let stopped = self
            .emit_lifecycle(
                EventType::DaemonStopped,
                lifecycle.epoch,
                Payload::new().with("heartbeat_count", heartbeats),
            )
            .await;
        let flushed = self.ledger.flush().await;
        self.running.store(false, Ordering::Release);
        drop(lifecycle);

        if let Err(err) = &stopped {
            error!(error = %err, "daemon_stopped could not be committed");
        }
        stopped?;
        flushed.map_err(DaemonError::Flush)?;

        info!(session_id = %self.session_id, heartbeats, "Daemon stopped");
        Ok(true)
    }

    /// Stop if running, then close the ledger. Emits through any remaining
    /// [`Ledger`] clone fail with [`EmitError::Closed`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first error from stopping or the final flush.
    pub async fn close(self) -> Result<(), DaemonError> {
        let stopped = self.stop().await;
        let closed = self.ledger.close().await;
        stopped?;
        closed.map_err(DaemonError::Flush)?;
        info!(session_id = %self.session_id, "Daemon closed");
        Ok(())
    }

    /// Submit an event.
    ///
    /// # Errors
    ///
    /// See [`Ledger::emit`].
    pub async fn emit(
        &self,
        event_type: impl Into<EventType>,
        payload: Payload,
        actor_id: impl Into<String>,
        subject_id: Option<&str>,
        task_id: Option<&str>,
    ) -> Result<EmitOutcome, EmitError> {
        let mut draft = EventDraft::new(event_type, actor_id).payload(payload);
        if let Some(subject_id) = subject_id {
            draft = draft.subject(subject_id);
        }
        if let Some(task_id) = task_id {
            draft = draft.task(task_id);
        }
        self.ledger.emit(draft).await
    }

    /// Submit a fully built draft, including an optional source reference
    /// or explicit dedupe key.
    ///
    /// # Errors
    ///
    /// See [`Ledger::emit`].
    pub async fn submit(&self, draft: EventDraft) -> Result<EmitOutcome, EmitError> {
        self.ledger.emit(draft).await
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
        self.ledger.emit_custom_event(event_type, payload).await
    }

    /// Filtered read from the index.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if the index cannot be read.
    pub async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, QueryError> {
        self.ledger.query_events(query).await
    }

    /// Register a synchronous listener. It runs on the dispatcher task,
    /// never on the emitting task.
    pub fn add_listener<L>(&self, listener: L) -> ListenerId
    where
        L: EventListener + 'static,
    {
        self.ledger.add_listener(listener)
    }

    /// Unregister a listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.ledger.remove_listener(id)
    }

    /// Wait until listeners have seen every event committed so far.
    pub async fn wait_for_listeners(&self) {
        self.ledger.wait_for_listeners().await;
    }

    /// Asynchronous stream of committed events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ledger.subscribe()
    }

    /// Current health.
    pub fn health(&self) -> HealthSnapshot {
        let status = self.ledger.status();
        HealthSnapshot {
            running: self.running.load(Ordering::Acquire),
            heartbeat_count: self.heartbeat_stats.count(),
            last_heartbeat_time: self.heartbeat_stats.last_time(),
            total_events: status.total_events,
            last_sequence_id: status.last_sequence_id,
            last_error: status.last_error,
            degraded: status.degraded,
            index_stale: status.index_stale,
            session_id: self.session_id,
            started_at: *self.started_at.lock().unwrap_or_else(PoisonError::into_inner),
            listener_count: status.listener_count,
        }
    }

    /// Whether the heartbeat is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Identifier of this daemon session.
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The configuration the daemon was opened with.
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// The underlying ledger, for reindex and parity checks.
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    async fn emit_lifecycle(
        &self,
        event_type: EventType,
        epoch: u64,
        payload: Payload,
    ) -> Result<EmitOutcome, EmitError> {
        let session = self.session_id.to_string();
        let draft = EventDraft::new(event_type, DAEMON_ACTOR)
            .payload(
                payload
                    .with("session_id", session.clone())
                    .with("epoch", epoch),
            )
            .source_ref(format!("{session}/{epoch}"));
        self.ledger.emit(draft).await
    }
}
