//! Coordinator - the public surface of the engine.
//!
//! Composes the task registry, the mailboxes and the event dispatcher.
//! Every operation returns `CoordError`; events reach subscribers through
//! the dispatcher after the corresponding write has committed.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::status::{BoardStatus, StatusReport};
use crate::config::EngineConfig;
use crate::dispatch::{EventDispatcher, EventHandler, SubscriptionHandle};
use crate::domain::{
    BoardName, EventType, Message, MessageId, NewTask, Outcome, Task, TaskId, TaskStatus, WorkerId,
};
use crate::error::{CoordError, ErrorKind};
use crate::mailbox::{self, Mailbox};
use crate::observability::BoardCounts;
use crate::registry::TaskRegistry;
use crate::store::{LockedStore, RepairOutcome};

/// Which ready tasks a worker is willing to take.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFilter {
    /// Tasks requiring anything outside this set are skipped.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Skip tasks whose priority value is above this.
    #[serde(default)]
    pub max_priority: Option<i32>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_max_priority(mut self, max_priority: i32) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    fn accepts(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task.owner.is_none()
            && task.fits(&self.capabilities)
            && self.max_priority.is_none_or(|max| task.priority <= max)
    }
}

/// A board addressed from outside: one of the task boards or a worker's
/// mailbox (`mailbox.<worker>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardRef {
    Tasks(BoardName),
    Mailbox(WorkerId),
}

impl fmt::Display for BoardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardRef::Tasks(board) => board.fmt(f),
            BoardRef::Mailbox(worker) => f.write_str(&mailbox::board_name(worker)),
        }
    }
}

impl FromStr for BoardRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(worker) = s.strip_prefix(mailbox::MAILBOX_PREFIX) {
            return WorkerId::parse(worker).map(BoardRef::Mailbox);
        }
        s.parse::<BoardName>().map(BoardRef::Tasks)
    }
}

pub struct Coordinator {
    config: EngineConfig,
    store: Arc<LockedStore>,
    registry: TaskRegistry,
    mailbox: Mailbox,
    dispatcher: Arc<EventDispatcher>,
}

impl Coordinator {
    pub(crate) fn new(
        config: EngineConfig,
        store: Arc<LockedStore>,
        registry: TaskRegistry,
        mailbox: Mailbox,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            mailbox,
            dispatcher,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================
    // tasks
    // ========================================

    pub async fn submit_task(&self, task: NewTask) -> Result<Task, CoordError> {
        self.registry.add_task(task).await
    }

    pub async fn promote(&self, id: &TaskId) -> Result<Task, CoordError> {
        self.registry.promote_ready(id).await
    }

    pub async fn promote_unblocked(&self) -> Result<Vec<TaskId>, CoordError> {
        self.registry.promote_unblocked().await
    }

    /// Claim the most urgent ready task the filter accepts.
    ///
    /// Lowest priority value wins; ties go to the task that reached `ready`
    /// first. A task lost to a concurrent claimer is skipped and selection
    /// runs again, up to `claim_reselect_attempts` times.
    pub async fn claim_next(
        &self,
        worker: &WorkerId,
        filter: &ClaimFilter,
    ) -> Result<Task, CoordError> {
        let attempts = self.config.claim_reselect_attempts.max(1);
        let mut lost: BTreeSet<TaskId> = BTreeSet::new();

        for attempt in 0..attempts {
            let ready = self.registry.ready_tasks().await?;
            let Some(candidate) = select_candidate(&ready, filter, &lost) else {
                break;
            };
            match self.registry.claim(&candidate, worker).await {
                Ok(task) => return Ok(task),
                Err(err) if err.kind() == ErrorKind::Conflict => {
                    debug!(
                        task_id = %candidate,
                        worker_id = %worker,
                        attempt,
                        error = %err,
                        "lost claim race, reselecting"
                    );
                    lost.insert(candidate);
                }
                Err(err) => return Err(err),
            }
        }

        Err(CoordError::NoClaimableTask {
            worker_id: worker.to_string(),
        })
    }

    pub async fn report_progress(
        &self,
        id: &TaskId,
        status: TaskStatus,
        note: Option<&str>,
    ) -> Result<Task, CoordError> {
        self.registry.update(id, status, note).await
    }

    pub async fn annotate(&self, id: &TaskId, note: &str) -> Result<Task, CoordError> {
        self.registry.annotate(id, note).await
    }

    /// Move a working task to `completed` or `failed`.
    ///
    /// With `auto_promote` on, a completion also sweeps the backlog. The
    /// sweep runs after the finish has committed, so its failure is logged
    /// rather than returned.
    pub async fn finish(
        &self,
        id: &TaskId,
        outcome: Outcome,
        notes: &str,
    ) -> Result<Task, CoordError> {
        let task = self.registry.finish(id, outcome, notes).await?;
        if outcome == Outcome::Completed && self.config.auto_promote {
            match self.registry.promote_unblocked().await {
                Ok(promoted) if !promoted.is_empty() => {
                    info!(task_id = %id, promoted = promoted.len(), "completion unblocked tasks");
                }
                Ok(_) => {}
                Err(err) => warn!(task_id = %id, error = %err, "backlog sweep after completion failed"),
            }
        }
        Ok(task)
    }

    pub async fn release(&self, id: &TaskId, reason: &str) -> Result<Task, CoordError> {
        self.registry.release(id, reason).await
    }

    /// Release tasks claimed longer ago than `threshold` (default: the
    /// configured liveness threshold).
    pub async fn reclaim_stale(
        &self,
        threshold: Option<Duration>,
    ) -> Result<Vec<TaskId>, CoordError> {
        let threshold = threshold.unwrap_or_else(|| self.config.liveness_threshold());
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| CoordError::Config(format!("liveness threshold: {e}")))?;
        self.registry.reclaim_stale(threshold).await
    }

    // ========================================
    // messages
    // ========================================

    pub async fn send_message(&self, message: Message) -> Result<MessageId, CoordError> {
        self.mailbox.send(message).await
    }

    /// Send a message given in its JSON wire form.
    pub async fn send_raw_message(&self, raw: &str) -> Result<MessageId, CoordError> {
        self.mailbox.send_json(raw).await
    }

    pub async fn poll_mailbox(&self, worker: &WorkerId) -> Result<Vec<Message>, CoordError> {
        self.mailbox.receive(worker).await
    }

    pub async fn ack_message(
        &self,
        worker: &WorkerId,
        message_id: MessageId,
    ) -> Result<Message, CoordError> {
        self.mailbox.ack(worker, message_id).await
    }

    // ========================================
    // events
    // ========================================

    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        self.dispatcher.register_handler(event_type, handler)
    }

    /// Subscribe one handler to every event type.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Vec<SubscriptionHandle> {
        EventType::ALL
            .into_iter()
            .map(|event_type| self.subscribe(event_type, Arc::clone(&handler)))
            .collect()
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.dispatcher.unregister(handle)
    }

    /// Start delivering events (only needed after `paused_events`).
    pub fn start_events(&self) {
        self.dispatcher.start();
    }

    /// Wait until every event emitted so far has reached its handlers.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    // ========================================
    // queries
    // ========================================

    pub async fn task(&self, id: &TaskId) -> Result<Task, CoordError> {
        self.registry.get(id).await
    }

    pub async fn list(&self, board: BoardName) -> Result<Vec<Task>, CoordError> {
        self.registry.list(board).await
    }

    pub async fn counts(&self) -> Result<BoardCounts, CoordError> {
        self.registry.counts().await
    }

    /// Per-board health. Unreadable boards are reported, not raised.
    pub async fn status(&self) -> Result<StatusReport, CoordError> {
        let mut boards = Vec::with_capacity(BoardName::ALL.len());
        for board in BoardName::ALL {
            let quarantine = self.store.quarantine_reason(board.as_str())?;
            let entry = match self.registry.list(board).await {
                Ok(tasks) => BoardStatus::readable(board, tasks.len(), quarantine),
                Err(err) if err.kind() == ErrorKind::Corruption => {
                    BoardStatus::unreadable(board, err.to_string(), quarantine)
                }
                Err(err) => return Err(err),
            };
            boards.push(entry);
        }
        Ok(StatusReport::new(boards, self.dispatcher.pending()))
    }

    // ========================================
    // maintenance
    // ========================================

    pub async fn repair(&self, board: &BoardRef) -> Result<RepairOutcome, CoordError> {
        let outcome = match board {
            BoardRef::Tasks(name) => self.registry.repair(*name).await?,
            BoardRef::Mailbox(worker) => self.mailbox.repair(worker).await?,
        };
        info!(board = %board, outcome = ?outcome, "repair finished");
        Ok(outcome)
    }

    pub async fn clear_quarantine(&self, board: &BoardRef) -> Result<(), CoordError> {
        match board {
            BoardRef::Tasks(name) => self.registry.clear_quarantine(*name).await,
            BoardRef::Mailbox(worker) => self.mailbox.clear_quarantine(worker).await,
        }
    }

    /// Deliver what is already queued, then stop the dispatcher.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        info!("coordinator stopped");
    }
}

/// Lowest priority value, then earliest position on the board.
fn select_candidate(ready: &[Task], filter: &ClaimFilter, lost: &BTreeSet<TaskId>) -> Option<TaskId> {
    ready
        .iter()
        .enumerate()
        .filter(|(_, task)| !lost.contains(&task.id) && filter.accepts(task))
        .min_by_key(|(position, task)| (task.priority, *position))
        .map(|(_, task)| task.id.clone())
}
