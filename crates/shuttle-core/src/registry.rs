//! TaskRegistry - task lifecycle as atomic moves between boards.
//!
//! Design:
//! - Each lifecycle step is one `LockedStore` transaction over the source
//!   board and (for moves) the destination board.
//! - `index` maps task id -> board. It is a lookup hint only: every
//!   transaction re-checks the source board, and a miss refreshes the index
//!   from snapshots before the error is classified.
//! - One event per committed mutation, emitted after the commit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{
    BoardName, Event, EventType, FailureReason, NewTask, Outcome, Task, TaskId, TaskStatus,
    WorkerId,
};
use crate::error::{CoordError, ErrorKind};
use crate::observability::BoardCounts;
use crate::ports::{Clock, EventSink, IdGenerator};
use crate::store::{Board, BoardSet, LockedStore, Record, RepairOutcome};

/// A release decision went stale between the pre-read and the lock.
const RELEASE_ATTEMPTS: usize = 3;

pub struct TaskRegistry {
    store: Arc<LockedStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    max_reclaims: u32,
    index: RwLock<HashMap<TaskId, BoardName>>,
}

impl TaskRegistry {
    /// Open the registry: build the index and reconcile tasks left on two
    /// boards by an interrupted move.
    pub async fn open(
        store: Arc<LockedStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        max_reclaims: u32,
    ) -> Result<Self, CoordError> {
        let registry = Self {
            store,
            events,
            clock,
            ids,
            max_reclaims,
            index: RwLock::new(HashMap::new()),
        };
        registry.reconcile().await?;
        Ok(registry)
    }

    async fn reconcile(&self) -> Result<(), CoordError> {
        let mut seen: HashMap<TaskId, Vec<(BoardName, DateTime<Utc>)>> = HashMap::new();
        for board in BoardName::ALL {
            let tasks = match self.store.load::<Task>(board.as_str()).await {
                Ok(tasks) => tasks,
                Err(err @ CoordError::BoardCorruption { .. }) => {
                    warn!(board = %board, error = %err, "skipping corrupt board while indexing");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for task in tasks {
                seen.entry(task.id).or_default().push((board, task.updated_at));
            }
        }

        let mut index = HashMap::with_capacity(seen.len());
        for (id, mut copies) in seen {
            // Newest copy wins; on a tie the later lifecycle board wins.
            copies.sort_by_key(|(board, updated_at)| (*updated_at, *board));
            let Some((keep, _)) = copies.pop() else {
                continue;
            };
            for (stale, _) in copies {
                warn!(task_id = %id, kept = %keep, dropped = %stale, "task found on two boards");
                let key = id.to_string();
                self.store
                    .read_modify_write(stale.as_str(), |board: &mut Board<Task>| {
                        board.remove(&key);
                        Ok(())
                    })
                    .await?;
            }
            index.insert(id, keep);
        }
        *self.index.write().await = index;
        Ok(())
    }

    // ========================================
    // lifecycle
    // ========================================

    pub async fn add_task(&self, new: NewTask) -> Result<Task, CoordError> {
        let id = match new.id.clone() {
            Some(raw) => TaskId::parse(raw).map_err(CoordError::InvalidTask)?,
            None => self.ids.generate_task_id(),
        };
        let task = Task::from_new(id.clone(), new, self.now()).map_err(CoordError::InvalidTask)?;

        if self.index.read().await.contains_key(&id) {
            return Err(CoordError::DuplicateId(id));
        }
        // A board that cannot be read (and has no cached copy) might hold
        // the id, so the submit is refused until it is repaired.
        for board in &BoardName::ALL[1..] {
            let tasks = self
                .store
                .snapshot::<Task>(board.as_str())
                .await
                .inspect_err(|err| {
                    warn!(board = %board, error = %err, "duplicate check cannot read board");
                })?;
            if tasks.iter().any(|t| t.id == id) {
                self.index.write().await.insert(id.clone(), *board);
                return Err(CoordError::DuplicateId(id));
            }
        }

        self.store
            .read_modify_write(BoardName::Backlog.as_str(), |backlog: &mut Board<Task>| {
                if backlog.insert(task.clone()) {
                    Ok(())
                } else {
                    Err(CoordError::DuplicateId(task.id.clone()))
                }
            })
            .await?;

        self.index.write().await.insert(id.clone(), BoardName::Backlog);
        info!(task_id = %id, priority = task.priority, "task submitted");
        self.emit(
            EventType::TaskSubmitted,
            id.as_str(),
            json!({ "task_id": id, "title": task.title, "priority": task.priority }),
        );
        Ok(task)
    }

    /// backlog -> ready, once every dependency is completed.
    pub async fn promote_ready(&self, id: &TaskId) -> Result<Task, CoordError> {
        let completed = self.completed_ids().await?;
        let key = id.to_string();
        let now = self.now();

        let result = self
            .store
            .transact(
                &[BoardName::Backlog.as_str(), BoardName::Ready.as_str()],
                |set: &mut BoardSet<Task>| {
                    let (backlog, ready) =
                        set.pair_mut(BoardName::Backlog.as_str(), BoardName::Ready.as_str())?;
                    let task = backlog
                        .find(&key)
                        .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?;
                    let pending = unresolved(task, &completed);
                    if !pending.is_empty() {
                        return Err(CoordError::DependencyUnresolved {
                            task_id: id.clone(),
                            pending,
                        });
                    }
                    let mut task = backlog
                        .remove(&key)
                        .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?;
                    task.updated_at = now;
                    ready.insert(task.clone());
                    Ok(task)
                },
            )
            .await;
        let task = match result {
            Err(CoordError::TaskNotFound(_)) => {
                return Err(self.misplaced(id, BoardName::Backlog).await);
            }
            other => other?,
        };

        self.index.write().await.insert(id.clone(), BoardName::Ready);
        debug!(task_id = %id, "task promoted");
        self.emit(
            EventType::TaskPromoted,
            id.as_str(),
            json!({ "task_id": id }),
        );
        Ok(task)
    }

    /// Promote every backlog task whose dependencies are all completed.
    pub async fn promote_unblocked(&self) -> Result<Vec<TaskId>, CoordError> {
        let completed = self.completed_ids().await?;
        let now = self.now();

        let promoted = self
            .store
            .transact(
                &[BoardName::Backlog.as_str(), BoardName::Ready.as_str()],
                |set: &mut BoardSet<Task>| {
                    let (backlog, ready) =
                        set.pair_mut(BoardName::Backlog.as_str(), BoardName::Ready.as_str())?;
                    let eligible: Vec<String> = backlog
                        .records()
                        .iter()
                        .filter(|t| unresolved(t, &completed).is_empty())
                        .map(Record::key)
                        .collect();
                    let mut promoted = Vec::with_capacity(eligible.len());
                    for key in eligible {
                        if let Some(mut task) = backlog.remove(&key) {
                            task.updated_at = now;
                            promoted.push(task.id.clone());
                            ready.insert(task);
                        }
                    }
                    Ok(promoted)
                },
            )
            .await?;

        if !promoted.is_empty() {
            let mut index = self.index.write().await;
            for id in &promoted {
                index.insert(id.clone(), BoardName::Ready);
            }
        }
        for id in &promoted {
            self.emit(
                EventType::TaskPromoted,
                id.as_str(),
                json!({ "task_id": id }),
            );
        }
        if !promoted.is_empty() {
            info!(count = promoted.len(), "promoted unblocked tasks");
        }
        Ok(promoted)
    }

    /// ready -> working, owned by `worker`.
    pub async fn claim(&self, id: &TaskId, worker: &WorkerId) -> Result<Task, CoordError> {
        let key = id.to_string();
        let now = self.now();

        let result = self
            .store
            .transact(
                &[BoardName::Ready.as_str(), BoardName::Working.as_str()],
                |set: &mut BoardSet<Task>| {
                    let (ready, working) =
                        set.pair_mut(BoardName::Ready.as_str(), BoardName::Working.as_str())?;
                    let task = ready
                        .find(&key)
                        .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?;
                    if let Some(owner) = &task.owner {
                        return Err(CoordError::TaskNotClaimable {
                            task_id: id.clone(),
                            reason: format!("already owned by {owner}"),
                        });
                    }
                    if task.status != TaskStatus::Pending {
                        return Err(CoordError::TaskNotClaimable {
                            task_id: id.clone(),
                            reason: format!("status is {:?}", task.status),
                        });
                    }
                    if working.contains(&key) {
                        return Err(CoordError::TaskNotClaimable {
                            task_id: id.clone(),
                            reason: "already on the working board".to_string(),
                        });
                    }
                    let mut task = ready
                        .remove(&key)
                        .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?;
                    task.mark_claimed(worker.clone(), now);
                    working.insert(task.clone());
                    Ok(task)
                },
            )
            .await;
        let task = match result {
            Err(CoordError::TaskNotFound(_)) => {
                let reason = match self.locate_fresh(id).await {
                    Some(board) => format!("task is on the {board} board"),
                    None => "task is unknown".to_string(),
                };
                return Err(CoordError::TaskNotClaimable {
                    task_id: id.clone(),
                    reason,
                });
            }
            other => other?,
        };

        self.index.write().await.insert(id.clone(), BoardName::Working);
        info!(task_id = %id, worker_id = %worker, "task claimed");
        self.emit(
            EventType::TaskClaimed,
            id.as_str(),
            json!({ "task_id": id, "worker_id": worker }),
        );
        Ok(task)
    }

    /// Report progress on a working task.
    pub async fn update(
        &self,
        id: &TaskId,
        status: TaskStatus,
        note: Option<&str>,
    ) -> Result<Task, CoordError> {
        let key = id.to_string();
        let now = self.now();

        let result = self
            .store
            .read_modify_write(BoardName::Working.as_str(), |working: &mut Board<Task>| {
                let from = working
                    .find(&key)
                    .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?
                    .status;
                if !from.can_progress_to(status) {
                    return Err(CoordError::InvalidTransition {
                        task_id: id.clone(),
                        from,
                        to: status,
                    });
                }
                working
                    .update(&key, |task| {
                        task.set_status(status, now);
                        if let Some(note) = note {
                            task.add_note(note, now);
                        }
                        (from, task.clone())
                    })
                    .ok_or_else(|| CoordError::TaskNotFound(id.clone()))
            })
            .await;
        let (from, task) = match result {
            Err(CoordError::TaskNotFound(_)) => {
                return Err(match self.misplaced(id, BoardName::Working).await {
                    CoordError::WrongBoard { .. } => CoordError::InvalidTransition {
                        task_id: id.clone(),
                        from: TaskStatus::Pending,
                        to: status,
                    },
                    other => other,
                });
            }
            other => other?,
        };

        debug!(task_id = %id, ?from, to = ?status, "task updated");
        self.emit(
            EventType::TaskUpdated,
            id.as_str(),
            json!({ "task_id": id, "from": from, "to": status, "note": note }),
        );
        Ok(task)
    }

    /// Append a note to a working task without touching its status.
    pub async fn annotate(&self, id: &TaskId, note: &str) -> Result<Task, CoordError> {
        if note.trim().is_empty() {
            return Err(CoordError::InvalidTask(format!("empty note for task {id}")));
        }
        let key = id.to_string();
        let now = self.now();

        let result = self
            .store
            .read_modify_write(BoardName::Working.as_str(), |working: &mut Board<Task>| {
                working
                    .update(&key, |task| {
                        task.add_note(note, now);
                        task.clone()
                    })
                    .ok_or_else(|| CoordError::TaskNotFound(id.clone()))
            })
            .await;
        let task = match result {
            Err(CoordError::TaskNotFound(_)) => {
                return Err(self.misplaced(id, BoardName::Working).await);
            }
            other => other?,
        };

        self.emit(
            EventType::TaskUpdated,
            id.as_str(),
            json!({ "task_id": id, "note": note }),
        );
        Ok(task)
    }

    pub async fn complete(&self, id: &TaskId, notes: &str) -> Result<Task, CoordError> {
        self.finish(id, Outcome::Completed, notes).await
    }

    pub async fn fail(&self, id: &TaskId, notes: &str) -> Result<Task, CoordError> {
        self.finish(id, Outcome::Failed, notes).await
    }

    /// working -> completed | failed.
    pub async fn finish(
        &self,
        id: &TaskId,
        outcome: Outcome,
        notes: &str,
    ) -> Result<Task, CoordError> {
        let key = id.to_string();
        let now = self.now();
        let target = outcome.status();
        let destination = outcome.board();

        let result = self
            .store
            .transact(
                &[BoardName::Working.as_str(), destination.as_str()],
                |set: &mut BoardSet<Task>| {
                    let (working, done) =
                        set.pair_mut(BoardName::Working.as_str(), destination.as_str())?;
                    let from = working
                        .find(&key)
                        .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?
                        .status;
                    if !from.can_finish_as(target) {
                        return Err(CoordError::InvalidTransition {
                            task_id: id.clone(),
                            from,
                            to: target,
                        });
                    }
                    if done.contains(&key) {
                        return Err(CoordError::TaskAlreadyTerminal(id.clone()));
                    }
                    let mut task = working
                        .remove(&key)
                        .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?;
                    match outcome {
                        Outcome::Completed => task.set_status(TaskStatus::Completed, now),
                        Outcome::Failed => task.mark_failed(FailureReason::WorkerReported, now),
                    }
                    task.add_note(notes, now);
                    done.insert(task.clone());
                    Ok(task)
                },
            )
            .await;
        let task = match result {
            Err(CoordError::TaskNotFound(_)) => {
                return Err(match self.misplaced(id, BoardName::Working).await {
                    CoordError::WrongBoard { .. } => CoordError::InvalidTransition {
                        task_id: id.clone(),
                        from: TaskStatus::Pending,
                        to: target,
                    },
                    other => other,
                });
            }
            other => other?,
        };

        self.index.write().await.insert(id.clone(), destination);
        let event_type = match outcome {
            Outcome::Completed => EventType::TaskCompleted,
            Outcome::Failed => EventType::TaskFailed,
        };
        info!(task_id = %id, outcome = ?outcome, "task finished");
        self.emit(
            event_type,
            id.as_str(),
            json!({ "task_id": id, "owner": task.owner, "notes": notes }),
        );
        Ok(task)
    }

    /// working -> ready (or failed once `max_reclaims` is exceeded).
    pub async fn release(&self, id: &TaskId, reason: &str) -> Result<Task, CoordError> {
        let key = id.to_string();

        for _ in 0..RELEASE_ATTEMPTS {
            let working = self.store.load::<Task>(BoardName::Working.as_str()).await?;
            let Some(seen) = working.iter().find(|t| t.id == *id) else {
                return Err(self.misplaced(id, BoardName::Working).await);
            };
            let seen_count = seen.reclaim_count;
            let exhausted = seen_count + 1 > self.max_reclaims;
            let destination = if exhausted {
                BoardName::Failed
            } else {
                BoardName::Ready
            };
            let now = self.now();

            let result = self
                .store
                .transact(
                    &[BoardName::Working.as_str(), destination.as_str()],
                    |set: &mut BoardSet<Task>| {
                        let (working, target) =
                            set.pair_mut(BoardName::Working.as_str(), destination.as_str())?;
                        let current = working
                            .find(&key)
                            .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?;
                        if current.reclaim_count != seen_count {
                            return Ok(None);
                        }
                        let mut task = working
                            .remove(&key)
                            .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?;
                        task.mark_released(now);
                        task.add_note(format!("released: {reason}"), now);
                        if exhausted {
                            task.mark_failed(FailureReason::MaxReclaimsExceeded, now);
                        }
                        target.insert(task.clone());
                        Ok(Some(task))
                    },
                )
                .await;
            let task = match result {
                Ok(Some(task)) => task,
                Ok(None) => {
                    debug!(task_id = %id, "release decision went stale, re-reading");
                    continue;
                }
                Err(CoordError::TaskNotFound(_)) => {
                    return Err(self.misplaced(id, BoardName::Working).await);
                }
                Err(err) => return Err(err),
            };

            self.index.write().await.insert(id.clone(), destination);
            if exhausted {
                warn!(task_id = %id, reclaims = task.reclaim_count, "reclaim ceiling reached, task failed");
                self.emit(
                    EventType::TaskFailed,
                    id.as_str(),
                    json!({
                        "task_id": id,
                        "reason": FailureReason::MaxReclaimsExceeded,
                        "reclaim_count": task.reclaim_count,
                    }),
                );
            } else {
                info!(task_id = %id, reason, "task released");
                self.emit(
                    EventType::TaskReleased,
                    id.as_str(),
                    json!({ "task_id": id, "reason": reason, "reclaim_count": task.reclaim_count }),
                );
            }
            return Ok(task);
        }

        Err(CoordError::LockTimeout {
            board: BoardName::Working.to_string(),
        })
    }

    /// Release every working task claimed longer than `threshold` ago.
    pub async fn reclaim_stale(&self, threshold: chrono::Duration) -> Result<Vec<TaskId>, CoordError> {
        let cutoff = self.now() - threshold;
        let working = self.store.load::<Task>(BoardName::Working.as_str()).await?;
        let stale: Vec<TaskId> = working
            .into_iter()
            .filter(|t| t.claimed_at.unwrap_or(t.updated_at) < cutoff)
            .map(|t| t.id)
            .collect();

        let mut released = Vec::with_capacity(stale.len());
        for id in stale {
            match self.release(&id, "claim went stale").await {
                Ok(_) => released.push(id),
                Err(err) if err.kind() == ErrorKind::Conflict => {
                    debug!(task_id = %id, error = %err, "stale task moved on before reclaim");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(released)
    }

    // ========================================
    // queries
    // ========================================

    pub async fn get(&self, id: &TaskId) -> Result<Task, CoordError> {
        let hinted = self.index.read().await.get(id).copied();
        if let Some(board) = hinted {
            let tasks = self.store.snapshot::<Task>(board.as_str()).await?;
            if let Some(task) = tasks.into_iter().find(|t| t.id == *id) {
                return Ok(task);
            }
        }
        let board = self
            .locate_fresh(id)
            .await
            .ok_or_else(|| CoordError::TaskNotFound(id.clone()))?;
        self.store
            .snapshot::<Task>(board.as_str())
            .await?
            .into_iter()
            .find(|t| t.id == *id)
            .ok_or_else(|| CoordError::TaskNotFound(id.clone()))
    }

    /// Status read of one board; may serve a cached snapshot.
    pub async fn list(&self, board: BoardName) -> Result<Vec<Task>, CoordError> {
        self.store.snapshot(board.as_str()).await
    }

    /// Strict read of the ready board, for claim selection.
    pub async fn ready_tasks(&self) -> Result<Vec<Task>, CoordError> {
        self.store.load(BoardName::Ready.as_str()).await
    }

    pub async fn counts(&self) -> Result<BoardCounts, CoordError> {
        let mut counts = BoardCounts::default();
        for board in BoardName::ALL {
            counts.set(board, self.list(board).await?.len());
        }
        Ok(counts)
    }

    // ========================================
    // maintenance
    // ========================================

    pub async fn repair(&self, board: BoardName) -> Result<RepairOutcome, CoordError> {
        let outcome = self.store.repair::<Task>(board.as_str()).await?;
        match &outcome {
            RepairOutcome::Healthy => {}
            RepairOutcome::Rebuilt { records, replayed } => {
                self.refresh_index().await;
                self.emit(
                    EventType::BoardRepaired,
                    board.as_str(),
                    json!({ "board": board, "records": records, "replayed": replayed }),
                );
            }
            RepairOutcome::Quarantined { reason } => {
                self.emit(
                    EventType::BoardQuarantined,
                    board.as_str(),
                    json!({ "board": board, "reason": reason }),
                );
            }
        }
        Ok(outcome)
    }

    pub async fn clear_quarantine(&self, board: BoardName) -> Result<(), CoordError> {
        self.store.clear_quarantine(board.as_str()).await?;
        self.refresh_index().await;
        self.emit(
            EventType::BoardRepaired,
            board.as_str(),
            json!({ "board": board, "quarantine_cleared": true }),
        );
        Ok(())
    }

    // ========================================
    // helpers
    // ========================================

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn emit(&self, event_type: EventType, source_id: &str, payload: serde_json::Value) {
        self.events
            .emit(Event::new(event_type, source_id, payload).at(self.now()));
    }

    async fn completed_ids(&self) -> Result<BTreeSet<TaskId>, CoordError> {
        Ok(self
            .store
            .snapshot::<Task>(BoardName::Completed.as_str())
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect())
    }

    /// Rebuild the index from snapshots. Boards that cannot be read keep
    /// their previous entries.
    async fn refresh_index(&self) {
        let mut fresh = HashMap::new();
        let mut unreadable = Vec::new();
        for board in BoardName::ALL {
            match self.store.snapshot::<Task>(board.as_str()).await {
                Ok(tasks) => {
                    for task in tasks {
                        fresh.insert(task.id, board);
                    }
                }
                Err(err) => {
                    warn!(board = %board, error = %err, "board unreadable while refreshing index");
                    unreadable.push(board);
                }
            }
        }
        let mut index = self.index.write().await;
        for (id, board) in index.iter() {
            if unreadable.contains(board) && !fresh.contains_key(id) {
                fresh.insert(id.clone(), *board);
            }
        }
        *index = fresh;
    }

    async fn locate_fresh(&self, id: &TaskId) -> Option<BoardName> {
        self.refresh_index().await;
        self.index.read().await.get(id).copied()
    }

    /// Classify a task that was not on the board an operation expected.
    async fn misplaced(&self, id: &TaskId, expected: BoardName) -> CoordError {
        match self.locate_fresh(id).await {
            None => CoordError::TaskNotFound(id.clone()),
            Some(actual) if actual.is_terminal() && !expected.is_terminal() => {
                CoordError::TaskAlreadyTerminal(id.clone())
            }
            Some(actual) => CoordError::WrongBoard {
                task_id: id.clone(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            },
        }
    }
}

/// Dependencies of `task` not yet completed, sorted.
fn unresolved(task: &Task, completed: &BTreeSet<TaskId>) -> Vec<TaskId> {
    task.dependencies
        .iter()
        .filter(|dep| !completed.contains(*dep))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryBoardStore;
    use crate::ports::{CollectingEventSink, FixedClock, UlidGenerator};
    use crate::store::{RetryExecutor, RetryPolicy};
    use chrono::TimeZone;
    use std::time::Duration;

    struct Fixture {
        registry: TaskRegistry,
        backend: Arc<MemoryBoardStore>,
        events: Arc<CollectingEventSink>,
        clock: Arc<FixedClock>,
    }

    async fn fixture(max_reclaims: u32) -> Fixture {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = Arc::new(LockedStore::new(
            backend.clone(),
            RetryExecutor::new(RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                ..RetryPolicy::default()
            }),
            Duration::from_millis(50),
            4,
        ));
        let events = Arc::new(CollectingEventSink::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));
        let registry = TaskRegistry::open(
            store,
            events.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            max_reclaims,
        )
        .await
        .unwrap();
        Fixture {
            registry,
            backend,
            events,
            clock,
        }
    }

    fn tid(s: &str) -> TaskId {
        TaskId::parse(s).unwrap()
    }

    fn worker(s: &str) -> WorkerId {
        WorkerId::parse(s).unwrap()
    }

    async fn claimed(f: &Fixture, id: &str) -> Task {
        f.registry.add_task(NewTask::new(id).with_id(id)).await.unwrap();
        f.registry.promote_ready(&tid(id)).await.unwrap();
        f.registry.claim(&tid(id), &worker("w1")).await.unwrap()
    }

    fn event_types(f: &Fixture) -> Vec<EventType> {
        f.events.events().into_iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn add_task_rejects_duplicates_on_any_board() {
        let f = fixture(3).await;
        claimed(&f, "T1").await;

        let err = f
            .registry
            .add_task(NewTask::new("again").with_id("T1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn add_task_refuses_while_a_board_cannot_be_checked() {
        let f = fixture(3).await;
        claimed(&f, "T1").await;
        f.registry.complete(&tid("T1"), "done").await.unwrap();
        f.backend.corrupt("completed");

        // A fresh registry has neither an index entry nor a cached snapshot.
        let store = Arc::new(LockedStore::new(
            f.backend.clone(),
            RetryExecutor::default(),
            Duration::from_millis(50),
            4,
        ));
        let reopened = TaskRegistry::open(
            store,
            f.events.clone(),
            f.clock.clone(),
            Arc::new(UlidGenerator::new(f.clock.clone())),
            3,
        )
        .await
        .unwrap();

        let err = reopened
            .add_task(NewTask::new("again").with_id("T1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::BoardCorruption { .. }));
        assert!(reopened.list(BoardName::Backlog).await.unwrap().is_empty());

        reopened.repair(BoardName::Completed).await.unwrap();
        assert!(matches!(
            reopened.add_task(NewTask::new("again").with_id("T1")).await,
            Err(CoordError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn add_task_generates_ids_and_validates_input() {
        let f = fixture(3).await;
        let task = f.registry.add_task(NewTask::new("anon")).await.unwrap();
        assert!(task.id.as_str().starts_with("task-"));

        let err = f
            .registry
            .add_task(NewTask::new("bad").with_id("has space"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidTask(_)));
        let err = f
            .registry
            .add_task(NewTask::new("loop").with_id("T9").depends_on("T9"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn promote_waits_for_completed_dependencies() {
        let f = fixture(3).await;
        claimed(&f, "T1").await;
        f.registry
            .add_task(NewTask::new("T2").with_id("T2").depends_on("T1"))
            .await
            .unwrap();

        let err = f.registry.promote_ready(&tid("T2")).await.unwrap_err();
        match err {
            CoordError::DependencyUnresolved { pending, .. } => assert_eq!(pending, vec![tid("T1")]),
            other => panic!("expected DependencyUnresolved, got {other:?}"),
        }

        f.registry.complete(&tid("T1"), "done").await.unwrap();
        let task = f.registry.promote_ready(&tid("T2")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(f.registry.list(BoardName::Ready).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn promote_reports_wrong_board_and_unknown_ids() {
        let f = fixture(3).await;
        claimed(&f, "T1").await;
        assert!(matches!(
            f.registry.promote_ready(&tid("T1")).await,
            Err(CoordError::WrongBoard { .. })
        ));
        assert!(matches!(
            f.registry.promote_ready(&tid("nope")).await,
            Err(CoordError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let f = fixture(3).await;
        let task = claimed(&f, "T1").await;
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.owner, Some(worker("w1")));
        assert!(task.claimed_at.is_some());

        let err = f.registry.claim(&tid("T1"), &worker("w2")).await.unwrap_err();
        assert!(matches!(err, CoordError::TaskNotClaimable { .. }));
    }

    #[tokio::test]
    async fn update_follows_the_transition_table() {
        let f = fixture(3).await;
        claimed(&f, "T1").await;

        let err = f
            .registry
            .update(&tid("T1"), TaskStatus::Blocked, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidTransition { .. }));

        f.registry
            .update(&tid("T1"), TaskStatus::InProgress, Some("started"))
            .await
            .unwrap();
        let task = f
            .registry
            .update(&tid("T1"), TaskStatus::Blocked, None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.notes.len(), 1);
    }

    #[tokio::test]
    async fn terminal_tasks_stay_terminal() {
        let f = fixture(3).await;
        claimed(&f, "T1").await;
        f.registry.complete(&tid("T1"), "shipped").await.unwrap();
        let before = f.registry.get(&tid("T1")).await.unwrap();
        let emitted = f.events.events().len();

        assert!(matches!(
            f.registry.complete(&tid("T1"), "again").await,
            Err(CoordError::TaskAlreadyTerminal(_))
        ));
        assert!(matches!(
            f.registry.fail(&tid("T1"), "late").await,
            Err(CoordError::TaskAlreadyTerminal(_))
        ));
        assert!(matches!(
            f.registry.update(&tid("T1"), TaskStatus::InProgress, None).await,
            Err(CoordError::TaskAlreadyTerminal(_))
        ));

        assert_eq!(f.registry.get(&tid("T1")).await.unwrap(), before);
        assert_eq!(f.events.events().len(), emitted);
    }

    #[tokio::test]
    async fn blocked_tasks_can_complete_or_fail() {
        let f = fixture(3).await;
        for id in ["T1", "T2"] {
            claimed(&f, id).await;
            f.registry
                .update(&tid(id), TaskStatus::InProgress, None)
                .await
                .unwrap();
            f.registry
                .update(&tid(id), TaskStatus::Blocked, None)
                .await
                .unwrap();
        }

        let task = f.registry.complete(&tid("T1"), "unblocked").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let task = f.registry.fail(&tid("T2"), "stuck").await.unwrap();
        assert_eq!(task.failure_reason, Some(FailureReason::WorkerReported));
        assert_eq!(f.registry.list(BoardName::Completed).await.unwrap().len(), 1);
        assert_eq!(f.registry.list(BoardName::Failed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_requeues_until_the_ceiling() {
        let f = fixture(1).await;
        claimed(&f, "T1").await;

        let task = f.registry.release(&tid("T1"), "worker left").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.reclaim_count, 1);
        assert!(task.owner.is_none());

        f.registry.claim(&tid("T1"), &worker("w2")).await.unwrap();
        let task = f.registry.release(&tid("T1"), "again").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure_reason, Some(FailureReason::MaxReclaimsExceeded));

        let counts = f.registry.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.ready, 0);
        assert_eq!(event_types(&f).last(), Some(&EventType::TaskFailed));
    }

    #[tokio::test]
    async fn reclaim_stale_releases_only_old_claims() {
        let f = fixture(3).await;
        claimed(&f, "T1").await;
        f.clock.advance(chrono::Duration::minutes(10));
        claimed(&f, "T2").await;

        let released = f
            .registry
            .reclaim_stale(chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(released, vec![tid("T1")]);
        assert_eq!(f.registry.get(&tid("T2")).await.unwrap().status, TaskStatus::Claimed);
    }

    #[tokio::test]
    async fn every_mutation_emits_exactly_one_event() {
        let f = fixture(3).await;
        claimed(&f, "T1").await;
        f.registry
            .update(&tid("T1"), TaskStatus::InProgress, None)
            .await
            .unwrap();
        f.registry.complete(&tid("T1"), "").await.unwrap();
        let _ = f.registry.promote_ready(&tid("T1")).await;

        assert_eq!(
            event_types(&f),
            vec![
                EventType::TaskSubmitted,
                EventType::TaskPromoted,
                EventType::TaskClaimed,
                EventType::TaskUpdated,
                EventType::TaskCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn promote_unblocked_sweeps_the_backlog() {
        let f = fixture(3).await;
        for id in ["A", "B"] {
            f.registry.add_task(NewTask::new(id).with_id(id)).await.unwrap();
        }
        f.registry
            .add_task(NewTask::new("C").with_id("C").depends_on("A"))
            .await
            .unwrap();

        let promoted = f.registry.promote_unblocked().await.unwrap();
        assert_eq!(promoted, vec![tid("A"), tid("B")]);
        assert_eq!(f.registry.list(BoardName::Backlog).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn open_keeps_the_newest_copy_of_a_duplicated_task() {
        let f = fixture(3).await;
        let task = claimed(&f, "T1").await;

        // Simulate a crash that left the old copy on `ready`.
        let mut stale = task.clone();
        stale.status = TaskStatus::Pending;
        stale.owner = None;
        stale.updated_at = task.updated_at - chrono::Duration::seconds(5);
        f.backend
            .inject("ready", serde_json::to_vec(&vec![stale]).unwrap());

        let reopened = TaskRegistry::open(
            f.registry.store.clone(),
            Arc::new(CollectingEventSink::new()),
            f.clock.clone(),
            Arc::new(UlidGenerator::new(f.clock.clone())),
            3,
        )
        .await
        .unwrap();
        assert!(reopened.list(BoardName::Ready).await.unwrap().is_empty());
        assert_eq!(
            reopened.get(&tid("T1")).await.unwrap().status,
            TaskStatus::Claimed
        );
    }

    #[tokio::test]
    async fn corrupt_board_is_repaired_and_reindexed() {
        let f = fixture(3).await;
        for id in ["T1", "T2"] {
            f.registry.add_task(NewTask::new(id).with_id(id)).await.unwrap();
        }
        f.backend.corrupt("backlog");

        let outcome = f.registry.repair(BoardName::Backlog).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Rebuilt { records: 2, .. }));
        assert_eq!(event_types(&f).last(), Some(&EventType::BoardRepaired));
        f.registry.promote_ready(&tid("T2")).await.unwrap();
    }
}
