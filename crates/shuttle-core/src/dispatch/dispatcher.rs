//! EventDispatcher - in-process priority queue in front of the handlers.
//!
//! `dispatch` only enqueues. One background task pops events in
//! (priority, timestamp, sequence) order and runs every handler registered
//! for the event's type, one after another. Each handler runs in its own
//! tokio task so a panic is contained and reported like an error.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde_json::json;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::handler::{EventHandler, HandlerRegistry, SubscriptionHandle};
use crate::domain::{Event, EventType};
use crate::ports::EventSink;

/// Queue entry.
///
/// Reverse ordering so BinaryHeap acts as a min-heap: lowest priority value
/// first, then oldest timestamp, then dispatch order.
#[derive(Debug)]
struct Queued {
    event: Event,
    seq: u64,
}

impl Queued {
    fn rank(&self) -> (i32, chrono::DateTime<chrono::Utc>, u64) {
        (self.event.priority, self.event.timestamp, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.rank().cmp(&self.rank())
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Queued>>,
    seq: AtomicU64,
    /// Queued plus in-flight events.
    pending: AtomicUsize,
    wakeup: Notify,
    idle: Notify,
    handlers: RwLock<HandlerRegistry>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, BinaryHeap<Queued>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enqueue(&self, event: Event) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue().push(Queued { event, seq });
        self.wakeup.notify_one();
    }

    fn pop(&self) -> Option<Event> {
        self.queue().pop().map(|q| q.event)
    }

    fn done_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        match self.handlers.read() {
            Ok(reg) => reg.handlers_for(event_type),
            Err(poisoned) => poisoned.into_inner().handlers_for(event_type),
        }
    }

    async fn deliver(&self, event: Event) {
        let handlers = self.handlers_for(event.event_type);
        debug!(event_type = %event.event_type, source_id = %event.source_id, handlers = handlers.len(), "delivering event");
        for handler in handlers {
            let owned = event.clone();
            let outcome = tokio::spawn(async move { handler.handle(&owned).await }).await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(join) if join.is_panic() => format!("handler panicked: {join}"),
                Err(join) => format!("handler aborted: {join}"),
            };
            error!(event_type = %event.event_type, source_id = %event.source_id, error = %failure, "event handler failed");
            if event.event_type != EventType::SystemError {
                self.enqueue(Event::new(
                    EventType::SystemError,
                    "dispatcher",
                    json!({
                        "failed_event_type": event.event_type,
                        "source_id": event.source_id,
                        "error": failure,
                    }),
                ));
            }
        }
    }
}

pub struct EventDispatcher {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// A stopped dispatcher; events queue up until `start`.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                pending: AtomicUsize::new(0),
                wakeup: Notify::new(),
                idle: Notify::new(),
                handlers: RwLock::new(HandlerRegistry::new()),
            }),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the delivery loop. Must run inside a tokio runtime. Calling it
    /// again while the loop runs does nothing.
    pub fn start(&self) {
        let mut worker = self.worker_slot();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shutdown_tx.send_replace(false);
        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *worker = Some(tokio::spawn(run(shared, shutdown_rx)));
    }

    pub fn register_handler(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        match self.shared.handlers.write() {
            Ok(mut reg) => reg.register(event_type, handler),
            Err(poisoned) => poisoned.into_inner().register(event_type, handler),
        }
    }

    pub fn unregister(&self, handle: SubscriptionHandle) -> bool {
        match self.shared.handlers.write() {
            Ok(mut reg) => reg.unregister(handle),
            Err(poisoned) => poisoned.into_inner().unregister(handle),
        }
    }

    /// Enqueue only; never waits for handlers.
    pub fn dispatch(&self, event: Event) {
        self.shared.enqueue(event);
    }

    /// Events queued or being delivered.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Wait until every queued event has been delivered. Only returns once
    /// the loop has been started (or nothing is pending).
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop the loop after it drains what is already queued.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.worker_slot().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatcher loop ended abnormally");
            }
        }
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventDispatcher {
    fn emit(&self, event: Event) {
        self.dispatch(event);
    }
}

async fn run(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if let Some(event) = shared.pop() {
            shared.deliver(event).await;
            shared.done_one();
            continue;
        }
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = shared.wakeup.notified() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("dispatcher loop stopped");
}
