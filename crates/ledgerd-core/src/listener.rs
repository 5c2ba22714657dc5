//! Listener fan-out.
//!
//! Committed events are handed, in sequence order, to a single dispatcher
//! task over an unbounded channel. The writer lock is released before any
//! listener runs, so a slow listener delays other listeners but never an
//! emit. Each call runs on the blocking pool under a timeout; a listener
//! that returns an error, panics or times out is logged and skipped, and
//! the next listener still runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use ledgerd_types::Event;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Error returned by a listener. Logged and recorded, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    /// Create a listener error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Observer of committed events.
///
/// Called once per committed event. Duplicates and rejected events are
/// never delivered.
pub trait EventListener: Send + Sync {
    /// Handle a committed event.
    ///
    /// # Errors
    ///
    /// Any error is logged by the ledger and does not affect the emit.
    fn on_event(&self, event: &Event) -> Result<(), ListenerError>;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Outcome of delivering one event to every listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that returned `Ok`.
    pub delivered: usize,
    /// Listeners that returned an error, panicked or timed out.
    pub failed: usize,
    /// Description of the last failure, if any.
    pub last_failure: Option<String>,
}

type Entry = (ListenerId, Arc<dyn EventListener>);

/// Ordered set of listeners.
pub struct ListenerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry>>,
    warn_after: Duration,
    timeout: Duration,
}

impl ListenerRegistry {
    /// Create an empty registry. Calls slower than `warn_after` are logged;
    /// calls still running after `timeout` are abandoned.
    pub fn new(warn_after: Duration, timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
            warn_after,
            timeout,
        }
    }

    /// Register a listener at the end of the delivery order.
    pub fn add(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener in registration order, one call
    /// at a time.
    ///
    /// A call that outlives the timeout is counted as failed and left to
    /// finish on the blocking pool; dispatch moves on without it.
    pub async fn dispatch(&self, event: &Arc<Event>) -> DispatchReport {
        // Snapshot so a listener may add or remove listeners without deadlock.
        let snapshot: Vec<Entry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = DispatchReport::default();
        for (id, listener) in snapshot {
            let started = Instant::now();
            let call = {
                let event = Arc::clone(event);
                tokio::task::spawn_blocking(move || listener.on_event(&event))
            };
            let result = tokio::time::timeout(self.timeout, call).await;
            let elapsed = started.elapsed();

            if elapsed > self.warn_after {
                warn!(
                    listener = %id,
                    sequence_id = event.sequence_id,
                    elapsed_ms = elapsed.as_millis(),
                    "Slow listener is holding up dispatch"
                );
            }

            let failure = match result {
                Ok(Ok(Ok(()))) => {
                    report.delivered = report.delivered.saturating_add(1);
                    continue;
                }
                Ok(Ok(Err(err))) => {
                    warn!(
                        listener = %id,
                        sequence_id = event.sequence_id,
                        error = %err,
                        "Listener returned an error"
                    );
                    format!("{id}: {err}")
                }
                Ok(Err(join)) if join.is_panic() => {
                    let reason = panic_message(join.into_panic().as_ref());
                    warn!(
                        listener = %id,
                        sequence_id = event.sequence_id,
                        panic = %reason,
                        "Listener panicked"
                    );
                    format!("{id} panicked: {reason}")
                }
                Ok(Err(join)) => {
                    warn!(listener = %id, error = %join, "Listener call was cancelled");
                    format!("{id} was cancelled: {join}")
                }
                Err(elapsed) => {
                    warn!(
                        listener = %id,
                        sequence_id = event.sequence_id,
                        timeout_ms = self.timeout.as_millis(),
                        error = %elapsed,
                        "Listener timed out"
                    );
                    format!("{id} timed out after {}ms", self.timeout.as_millis())
                }
            };
            report.failed = report.failed.saturating_add(1);
            report.last_failure = Some(failure);
        }
        report
    }
}

/// Work item for the dispatcher task.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// A committed event, sent in sequence order.
    Event(Arc<Event>),
    /// Completed once everything queued before it has been delivered.
    Barrier(oneshot::Sender<()>),
}

/// Drain `rx`, delivering events to `registry` in the order received.
///
/// `on_failure` receives the last failure of each dispatch that had one.
/// Returns when every sender is gone.
pub(crate) async fn run_dispatcher<F>(
    registry: Arc<ListenerRegistry>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    on_failure: F,
) where
    F: Fn(String) + Send + 'static,
{
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Event(event) => {
                let report = registry.dispatch(&event).await;
                if let Some(failure) = report.last_failure {
                    on_failure(failure);
                }
            }
            Dispatch::Barrier(done) => {
                // The waiter may have given up.
                let _ = done.send(());
            }
        }
    }
    debug!("Listener dispatcher stopped");
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .field("warn_after", &self.warn_after)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("non-string panic payload"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use ledgerd_types::{DedupeKey, EventDraft, EventId};

    use super::*;

    fn event(sequence_id: u64) -> Arc<Event> {
        Arc::new(EventDraft::new("test", "tester").into_event(
            EventId::new(),
            sequence_id,
            Utc::now(),
            DedupeKey::from_raw(format!("key-{sequence_id}")),
        ))
    }

    fn registry() -> ListenerRegistry {
        ListenerRegistry::new(Duration::from_secs(1), Duration::from_secs(5))
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn EventListener> {
        let log = Arc::clone(log);
        Arc::new(move |e: &Event| -> Result<(), ListenerError> {
            log.lock().unwrap().push(format!("{name}:{}", e.sequence_id));
            Ok(())
        })
    }

    #[tokio::test]
    async fn dispatch_in_registration_order() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(recorder("a", &log));
        registry.add(recorder("b", &log));

        let report = registry.dispatch(&event(7)).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:7", "b:7"]);
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_listeners() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(Arc::new(|_: &Event| -> Result<(), ListenerError> {
            Err(ListenerError::new("boom"))
        }));
        registry.add(Arc::new(|_: &Event| -> Result<(), ListenerError> {
            panic!("listener exploded")
        }));
        registry.add(recorder("after", &log));

        let report = registry.dispatch(&event(1)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert!(report.last_failure.unwrap().contains("listener exploded"));
        assert_eq!(*log.lock().unwrap(), vec!["after:1"]);
    }

    #[tokio::test]
    async fn hung_listener_is_abandoned_after_timeout() {
        let registry = ListenerRegistry::new(Duration::from_millis(10), Duration::from_millis(50));
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(Arc::new(|_: &Event| -> Result<(), ListenerError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        }));
        registry.add(recorder("after", &log));

        let started = Instant::now();
        let report = registry.dispatch(&event(3)).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(report.last_failure.unwrap().contains("timed out"));
        assert_eq!(*log.lock().unwrap(), vec!["after:3"]);
    }

    #[tokio::test]
    async fn dispatcher_delivers_in_send_order_and_honours_barriers() {
        let registry = Arc::new(registry());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(recorder("a", &log));
        let failures = Arc::new(Mutex::new(Vec::new()));

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::clone(&failures);
        let handle = tokio::spawn(run_dispatcher(Arc::clone(&registry), rx, move |f| {
            sink.lock().unwrap().push(f);
        }));

        for seq in 1..=3 {
            tx.send(Dispatch::Event(event(seq))).unwrap();
        }
        let (done, wait) = oneshot::channel();
        tx.send(Dispatch::Barrier(done)).unwrap();
        wait.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "a:2", "a:3"]);

        registry.add(Arc::new(|_: &Event| -> Result<(), ListenerError> {
            Err(ListenerError::new("nope"))
        }));
        tx.send(Dispatch::Event(event(4))).unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(failures.lock().unwrap().len(), 1);
        assert!(failures.lock().unwrap()[0].contains("nope"));
    }

    #[tokio::test]
    async fn remove_stops_delivery() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = registry.add(recorder("a", &log));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());

        registry.dispatch(&event(1)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.add(recorder("a", &log));
        let b = registry.add(recorder("b", &log));
        assert_ne!(a, b);
    }
}
