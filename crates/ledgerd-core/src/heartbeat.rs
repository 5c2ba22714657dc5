//! Periodic liveness events.
//!
//! While running, a background task emits a `heartbeat` event every
//! interval with payload `{heartbeat_number: N}`. The counter survives
//! stop/start cycles within one daemon session, and every heartbeat
//! carries the session id as its source reference, so heartbeats from
//! different sessions never collide on dedupe.
//!
//! A failed or panicking beat is logged and the next one is still
//! scheduled.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use ledgerd_types::{EventDraft, EventType, Payload, SessionId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::EmitError;
use crate::ledger::{EmitOutcome, Ledger};
use crate::listener::panic_message;

/// Actor recorded on heartbeat and lifecycle events.
pub const DAEMON_ACTOR: &str = "daemon";

/// Heartbeat counters shared between the task and health reads.
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    fired: AtomicU64,
    committed: AtomicU64,
    last_time: StdMutex<Option<DateTime<Utc>>>,
}

impl HeartbeatStats {
    /// Heartbeats successfully committed.
    pub fn count(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Time of the last committed heartbeat.
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        *self.last_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_number(&self) -> u64 {
        self.fired.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    fn record(&self, at: DateTime<Utc>) {
        self.committed.fetch_add(1, Ordering::AcqRel);
        *self.last_time.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Starts and stops the heartbeat task.
pub struct HeartbeatController {
    interval: Duration,
    session_id: SessionId,
    stats: Arc<HeartbeatStats>,
    running: Option<Running>,
}

impl HeartbeatController {
    /// A stopped controller.
    pub fn new(interval: Duration, session_id: SessionId) -> Self {
        Self {
            interval,
            session_id,
            stats: Arc::new(HeartbeatStats::default()),
            running: None,
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<HeartbeatStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the task is running.
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the heartbeat task. The first beat fires immediately. Returns
    /// `false` if already running.
    pub fn start(&mut self, ledger: Ledger) -> bool {
        if self.running.is_some() {
            return false;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            ledger,
            self.interval,
            self.session_id,
            Arc::clone(&self.stats),
            shutdown_rx,
        ));
        self.running = Some(Running { shutdown, handle });
        debug!(interval_ms = self.interval.as_millis(), "Heartbeat started");
        true
    }

    /// Stop the task and wait for an in-flight beat to finish. Returns
    /// `false` if it was not running.
    pub async fn stop(&mut self) -> bool {
        let Some(Running { shutdown, handle }) = self.running.take() else {
            return false;
        };
        // A send error means the task already exited.
        let _ = shutdown.send(true);
        if let Err(err) = handle.await {
            error!(error = %err, "Heartbeat task ended abnormally");
        }
        debug!(heartbeats = self.stats.count(), "Heartbeat stopped");
        true
    }
}

impl Drop for HeartbeatController {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.handle.abort();
        }
    }
}

impl std::fmt::Debug for HeartbeatController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatController")
            .field("interval", &self.interval)
            .field("session_id", &self.session_id)
            .field("running", &self.is_running())
            .field("count", &self.stats.count())
            .finish()
    }
}

async fn run(
    ledger: Ledger,
    interval: Duration,
    session_id: SessionId,
    stats: Arc<HeartbeatStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let number = stats.next_number();
                let result = AssertUnwindSafe(beat(&ledger, session_id, number))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(outcome)) => {
                        stats.record(Utc::now());
                        debug!(
                            heartbeat_number = number,
                            sequence_id = outcome.sequence_id(),
                            "Heartbeat"
                        );
                    }
                    Ok(Err(err)) => {
                        warn!(heartbeat_number = number, error = %err, "Heartbeat emit failed");
                        ledger.record_error(format!("heartbeat {number} failed: {err}"));
                    }
                    Err(panic) => {
                        let reason = panic_message(panic.as_ref());
                        error!(heartbeat_number = number, panic = %reason, "Heartbeat panicked");
                        ledger.record_error(format!("heartbeat {number} panicked: {reason}"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
thread_local! {
    /// Beat number that panics instead of emitting.
    static PANIC_ON_BEAT: std::cell::Cell<Option<u64>> = const { std::cell::Cell::new(None) };
}

#[cfg(test)]
#[allow(clippy::panic)]
fn fail_if_requested(number: u64) {
    if PANIC_ON_BEAT.with(std::cell::Cell::get) == Some(number) {
        panic!("heartbeat {number} forced to fail");
    }
}

async fn beat(ledger: &Ledger, session_id: SessionId, number: u64) -> Result<EmitOutcome, EmitError> {
    #[cfg(test)]
    fail_if_requested(number);
    let draft = EventDraft::new(EventType::Heartbeat, DAEMON_ACTOR)
        .payload(Payload::new().with("heartbeat_number", number))
        .source_ref(session_id.to_string());
    ledger.emit(draft).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use ledgerd_store::{EventQuery, StoreLayout};

    use super::*;
    use crate::ledger::LedgerOptions;

    #[tokio::test]
    async fn beats_are_numbered_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(StoreLayout::new(dir.path()), LedgerOptions::default())
            .await
            .unwrap();
        let mut controller = HeartbeatController::new(Duration::from_millis(10), SessionId::new());

        assert!(controller.start(ledger.clone()));
        assert!(!controller.start(ledger.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(controller.stop().await);
        assert!(!controller.stop().await);

        let stats = controller.stats();
        let beats = ledger
            .query_events(&EventQuery::new().event_type(EventType::Heartbeat))
            .await
            .unwrap();
        assert!(beats.len() >= 2, "only {} heartbeats", beats.len());
        assert_eq!(u64::try_from(beats.len()).unwrap(), stats.count());
        assert!(stats.last_time().is_some());
        for (i, beat) in beats.iter().enumerate() {
            let expected = u64::try_from(i).unwrap() + 1;
            assert_eq!(beat.payload.get_u64("heartbeat_number"), Some(expected));
            assert_eq!(beat.actor_id, DAEMON_ACTOR);
        }
    }

    #[tokio::test]
    async fn numbering_continues_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(StoreLayout::new(dir.path()), LedgerOptions::default())
            .await
            .unwrap();
        let mut controller = HeartbeatController::new(Duration::from_secs(3600), SessionId::new());

        // Each start fires one immediate beat.
        for _ in 0..2 {
            controller.start(ledger.clone());
            tokio::time::sleep(Duration::from_millis(50)).await;
            controller.stop().await;
        }

        let numbers: Vec<u64> = ledger
            .query_events(&EventQuery::new().event_type(EventType::Heartbeat))
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.payload.get_u64("heartbeat_number"))
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    // Current-thread runtime: the heartbeat task shares the test's thread.
    #[tokio::test]
    async fn panicking_beat_does_not_stop_the_timer() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(StoreLayout::new(dir.path()), LedgerOptions::default())
            .await
            .unwrap();
        PANIC_ON_BEAT.with(|n| n.set(Some(2)));
        let mut controller = HeartbeatController::new(Duration::from_millis(10), SessionId::new());

        controller.start(ledger.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        controller.stop().await;
        PANIC_ON_BEAT.with(|n| n.set(None));

        let numbers: Vec<u64> = ledger
            .query_events(&EventQuery::new().event_type(EventType::Heartbeat))
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.payload.get_u64("heartbeat_number"))
            .collect();
        assert_eq!(numbers.first(), Some(&1));
        assert!(!numbers.contains(&2));
        assert!(numbers.contains(&3), "timer stopped after the panic: {numbers:?}");
        assert_eq!(u64::try_from(numbers.len()).unwrap(), controller.stats().count());
        assert!(ledger.status().last_error.unwrap().contains("heartbeat 2 panicked"));
    }

    #[tokio::test]
    async fn failed_emits_are_recorded_and_the_timer_continues() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(StoreLayout::new(dir.path()), LedgerOptions::default())
            .await
            .unwrap();
        ledger.close().await.unwrap();
        let mut controller = HeartbeatController::new(Duration::from_millis(10), SessionId::new());

        controller.start(ledger.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.stop().await;

        assert_eq!(controller.stats().count(), 0);
        assert!(controller.stats().next_number() > 3);
        let last_error = ledger.status().last_error.unwrap();
        assert!(last_error.contains("ledger is closed"), "{last_error}");
    }
}
