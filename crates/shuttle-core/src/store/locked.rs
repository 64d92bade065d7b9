//! LockedStore - exclusive, crash-safe read-modify-write over boards.
//!
//! # Transaction protocol
//! 1. Lock every board in scope, in the global order (backlog < ready <
//!    working < completed < failed < mailbox boards by name). Each board is
//!    guarded by a process-local async mutex and then by the backend's
//!    cross-process lock; both must be obtained before `lock_timeout`.
//! 2. Refuse quarantined boards, then load and decode each board.
//! 3. Run the caller's closure on the working copies. An `Err` from the
//!    closure aborts without writing anything.
//! 4. Write dirty boards, destinations (boards that gained records) first.
//!    If a later write fails the earlier ones are restored to their loaded
//!    bytes.
//! 5. Journal the diff of each written board and checkpoint every
//!    `checkpoint_interval` journal lines.
//!
//! The whole protocol runs under `RetryExecutor`, so lock timeouts and
//! transient I/O errors restart it from step 1.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::board::{Board, BoardSet, Record, decode, encode};
use super::journal::{self, JournalEntry};
use super::retry::RetryExecutor;
use crate::domain::BoardName;
use crate::error::CoordError;
use crate::ports::{BoardLockGuard, BoardStore};

/// Most boards a single transaction may lock.
pub const MAX_LOCK_SCOPE: usize = 2;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Result of `LockedStore::repair`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// The board decoded fine and was not quarantined; nothing was touched.
    Healthy,
    /// Rebuilt from the backup (or from empty) plus the journal.
    Rebuilt { records: usize, replayed: usize },
    /// Nothing trustworthy to rebuild from; the board now refuses writes.
    Quarantined { reason: String },
}

/// Both halves of one board's lock. Dropping releases them.
struct HeldLock {
    _local: OwnedMutexGuard<()>,
    _backend: BoardLockGuard,
}

/// A board as it was when the transaction loaded it.
struct Loaded<T> {
    raw: Option<Vec<u8>>,
    records: Vec<T>,
}

/// A board about to be persisted.
struct PendingWrite<T> {
    name: String,
    bytes: Vec<u8>,
    before: Vec<T>,
    after: Vec<T>,
    original: Option<Vec<u8>>,
    gained: bool,
}

pub struct LockedStore {
    backend: Arc<dyn BoardStore>,
    retry: RetryExecutor,
    lock_timeout: Duration,
    checkpoint_interval: usize,
    local_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Last bytes of each board known to decode.
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
    /// Journal lines since the last checkpoint. Only touched under the
    /// board's lock.
    journal_depth: StdMutex<HashMap<String, usize>>,
}

impl LockedStore {
    pub fn new(
        backend: Arc<dyn BoardStore>,
        retry: RetryExecutor,
        lock_timeout: Duration,
        checkpoint_interval: usize,
    ) -> Self {
        Self {
            backend,
            retry,
            lock_timeout,
            checkpoint_interval: checkpoint_interval.max(1),
            local_locks: Mutex::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            journal_depth: StdMutex::new(HashMap::new()),
        }
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Lock one board, let `f` change it, persist.
    pub async fn read_modify_write<T, R, F>(&self, board: &str, f: F) -> Result<R, CoordError>
    where
        T: Record,
        F: Fn(&mut Board<T>) -> Result<R, CoordError> + Send + Sync,
    {
        self.transact(&[board], |set: &mut BoardSet<T>| f(set.get_mut(board)?))
            .await
    }

    /// Lock up to two boards and run `f` over them as one atomic step.
    ///
    /// `f` may run more than once when a transient failure forces a retry; it
    /// must only depend on the boards it is given.
    pub async fn transact<T, R, F>(&self, boards: &[&str], f: F) -> Result<R, CoordError>
    where
        T: Record,
        F: Fn(&mut BoardSet<T>) -> Result<R, CoordError> + Send + Sync,
    {
        let names = lock_order(boards);
        if names.len() > MAX_LOCK_SCOPE {
            return Err(CoordError::LockScope(names.len()));
        }
        let label = names.join("+");
        let names = &names;
        let f = &f;
        self.retry
            .execute(&label, move || self.transact_once(names, f))
            .await
    }

    async fn transact_once<T, R, F>(&self, names: &[String], f: &F) -> Result<R, CoordError>
    where
        T: Record,
        F: Fn(&mut BoardSet<T>) -> Result<R, CoordError>,
    {
        let deadline = Instant::now() + self.lock_timeout;
        let _held = self.acquire(names, deadline).await?;

        let mut loaded = Vec::with_capacity(names.len());
        for name in names {
            self.ensure_writable(name)?;
            let raw = self.backend.read(name).map_err(|e| CoordError::io(name, e))?;
            let records = match &raw {
                Some(bytes) => {
                    let records = decode::<T>(name, bytes)?;
                    self.remember(name, bytes.clone()).await;
                    records
                }
                None => Vec::new(),
            };
            loaded.push(Loaded { raw, records });
        }

        let mut set = BoardSet::new(
            names
                .iter()
                .zip(&loaded)
                .map(|(name, l)| Board::new(name.clone(), l.records.clone()))
                .collect(),
        );
        let output = f(&mut set)?;

        let mut pending = Vec::new();
        for (board, l) in set.into_boards().into_iter().zip(loaded) {
            if !board.is_dirty() {
                continue;
            }
            let name = board.name().to_string();
            let after = board.into_records();
            let gained = after
                .iter()
                .any(|r| !l.records.iter().any(|o| o.key() == r.key()));
            pending.push(PendingWrite {
                bytes: encode(&name, &after)?,
                name,
                before: l.records,
                after,
                original: l.raw,
                gained,
            });
        }
        // Stable sort: destinations first, lock order otherwise.
        pending.sort_by_key(|p| !p.gained);

        self.commit(&pending)?;
        for write in pending {
            self.record_commit(&write);
            self.remember(&write.name, write.bytes).await;
        }
        Ok(output)
    }

    fn commit<T: Record>(&self, pending: &[PendingWrite<T>]) -> Result<(), CoordError> {
        for (index, write) in pending.iter().enumerate() {
            if let Err(e) = self.backend.write(&write.name, &write.bytes) {
                let err = CoordError::io(&write.name, e);
                if index > 0 {
                    self.compensate(&pending[..index], &err)?;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Put boards already written by a failing transaction back as loaded.
    fn compensate<T: Record>(
        &self,
        written: &[PendingWrite<T>],
        cause: &CoordError,
    ) -> Result<(), CoordError> {
        for write in written.iter().rev() {
            let original = write.original.as_deref().unwrap_or(b"[]");
            if let Err(e) = self.backend.write(&write.name, original) {
                error!(
                    board = %write.name,
                    cause = %cause,
                    error = %e,
                    "failed to restore board after partial commit"
                );
                return Err(CoordError::Storage {
                    board: write.name.clone(),
                    source: e,
                });
            }
            warn!(board = %write.name, cause = %cause, "partial commit rolled back");
        }
        Ok(())
    }

    /// Journal one committed board and checkpoint when due.
    ///
    /// Runs after the board write succeeded, so failures here are logged
    /// rather than returned: the transaction has happened and must not be
    /// retried. A board whose bookkeeping failed stays readable; only its
    /// repair path is weakened until the next checkpoint.
    fn record_commit<T: Record>(&self, write: &PendingWrite<T>) {
        let line = journal::diff(&write.before, &write.after)
            .and_then(|ops| serde_json::to_vec(&JournalEntry::new(Utc::now(), ops)));
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(board = %write.name, error = %e, "could not encode journal entry");
                return;
            }
        };

        let depth = match self.journal_depth(&write.name) {
            Ok(depth) => depth,
            Err(e) => {
                warn!(board = %write.name, error = %e, "journal depth unknown");
                usize::MAX - 1
            }
        };
        let depth = match self.backend.append_journal(&write.name, &line) {
            Ok(()) => depth + 1,
            Err(e) => {
                warn!(board = %write.name, error = %e, "journal append failed, forcing checkpoint");
                usize::MAX
            }
        };
        if depth >= self.checkpoint_interval {
            if let Err(e) = self.checkpoint(&write.name, &write.bytes) {
                error!(board = %write.name, error = %e, "checkpoint failed");
            }
        } else {
            self.set_journal_depth(&write.name, depth);
        }
    }

    fn checkpoint(&self, name: &str, bytes: &[u8]) -> Result<(), CoordError> {
        self.backend
            .write_backup(name, bytes)
            .map_err(|e| CoordError::Storage {
                board: name.to_string(),
                source: e,
            })?;
        self.backend
            .clear_journal(name)
            .map_err(|e| CoordError::Storage {
                board: name.to_string(),
                source: e,
            })?;
        self.set_journal_depth(name, 0);
        debug!(board = name, "checkpoint written");
        Ok(())
    }

    fn journal_depth(&self, name: &str) -> Result<usize, CoordError> {
        if let Some(depth) = self.depths().get(name) {
            return Ok(*depth);
        }
        let depth = self
            .backend
            .read_journal(name)
            .map_err(|e| CoordError::io(name, e))?
            .map(|bytes| journal::count_lines(&bytes))
            .unwrap_or(0);
        self.set_journal_depth(name, depth);
        Ok(depth)
    }

    fn set_journal_depth(&self, name: &str, depth: usize) {
        self.depths().insert(name.to_string(), depth);
    }

    fn depths(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        match self.journal_depth.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ========================================
    // reads
    // ========================================

    /// Unlocked read of a board. Corruption is reported, not hidden.
    pub async fn load<T: Record>(&self, board: &str) -> Result<Vec<T>, CoordError> {
        self.retry
            .execute(board, move || async move {
                match self.backend.read(board).map_err(|e| CoordError::io(board, e))? {
                    Some(bytes) => {
                        let records = decode::<T>(board, &bytes)?;
                        self.remember(board, bytes).await;
                        Ok(records)
                    }
                    None => Ok(Vec::new()),
                }
            })
            .await
    }

    /// Status read: like `load`, but falls back to the last good snapshot
    /// when the board no longer decodes.
    pub async fn snapshot<T: Record>(&self, board: &str) -> Result<Vec<T>, CoordError> {
        match self.load(board).await {
            Err(err @ CoordError::BoardCorruption { .. }) => {
                let cached = self.snapshots.read().await.get(board).cloned();
                match cached {
                    Some(bytes) => {
                        warn!(board, error = %err, "serving cached snapshot of corrupt board");
                        decode(board, &bytes)
                    }
                    None => Err(err),
                }
            }
            other => other,
        }
    }

    pub fn quarantine_reason(&self, board: &str) -> Result<Option<String>, CoordError> {
        self.backend
            .quarantine_reason(board)
            .map_err(|e| CoordError::io(board, e))
    }

    // ========================================
    // repair
    // ========================================

    /// Rebuild a board that no longer decodes (or was quarantined) from its
    /// backup plus journal. Quarantines it when that is impossible.
    pub async fn repair<T: Record>(&self, board: &str) -> Result<RepairOutcome, CoordError> {
        let names = vec![board.to_string()];
        let names = &names;
        self.retry
            .execute(board, move || async move {
                let _held = self
                    .acquire(names, Instant::now() + self.lock_timeout)
                    .await?;
                self.repair_locked::<T>(board).await
            })
            .await
    }

    async fn repair_locked<T: Record>(&self, board: &str) -> Result<RepairOutcome, CoordError> {
        let quarantined = self.quarantine_reason(board)?;
        let current = self.backend.read(board).map_err(|e| CoordError::io(board, e))?;
        let decodes = match &current {
            Some(bytes) => decode::<T>(board, bytes).is_ok(),
            None => true,
        };
        if decodes && quarantined.is_none() {
            return Ok(RepairOutcome::Healthy);
        }

        let backup = self
            .backend
            .read_backup(board)
            .map_err(|e| CoordError::io(board, e))?;
        let journal_bytes = self
            .backend
            .read_journal(board)
            .map_err(|e| CoordError::io(board, e))?;

        if backup.is_none() && journal_bytes.is_none() {
            return self.quarantine(board, "no backup or journal to rebuild from");
        }
        let mut records: Vec<T> = match &backup {
            Some(bytes) => match decode(board, bytes) {
                Ok(records) => records,
                Err(e) => return self.quarantine(board, &format!("backup unreadable: {e}")),
            },
            None => Vec::new(),
        };
        let entries = match journal_bytes.as_deref().map(journal::parse).transpose() {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => return self.quarantine(board, &format!("journal unreadable: {e}")),
        };
        for entry in &entries {
            if let Err(e) = journal::replay(&mut records, entry) {
                return self.quarantine(board, &format!("journal replay failed: {e}"));
            }
        }

        let bytes = encode(board, &records)?;
        self.backend
            .write(board, &bytes)
            .map_err(|e| CoordError::io(board, e))?;
        self.checkpoint(board, &bytes)?;
        self.backend
            .clear_quarantine(board)
            .map_err(|e| CoordError::io(board, e))?;
        self.remember(board, bytes).await;

        info!(
            board,
            records = records.len(),
            replayed = entries.len(),
            "board rebuilt"
        );
        Ok(RepairOutcome::Rebuilt {
            records: records.len(),
            replayed: entries.len(),
        })
    }

    fn quarantine(&self, board: &str, reason: &str) -> Result<RepairOutcome, CoordError> {
        self.backend
            .set_quarantine(board, reason)
            .map_err(|e| CoordError::io(board, e))?;
        error!(board, reason, "board quarantined");
        Ok(RepairOutcome::Quarantined {
            reason: reason.to_string(),
        })
    }

    /// Lift a quarantine. The board content is left as it is.
    pub async fn clear_quarantine(&self, board: &str) -> Result<(), CoordError> {
        let names = vec![board.to_string()];
        let names = &names;
        self.retry
            .execute(board, move || async move {
                let _held = self
                    .acquire(names, Instant::now() + self.lock_timeout)
                    .await?;
                self.backend
                    .clear_quarantine(board)
                    .map_err(|e| CoordError::io(board, e))
            })
            .await?;
        info!(board, "quarantine cleared");
        Ok(())
    }

    // ========================================
    // locking
    // ========================================

    async fn acquire(&self, names: &[String], deadline: Instant) -> Result<Vec<HeldLock>, CoordError> {
        let mut held = Vec::with_capacity(names.len());
        for name in names {
            let local = self.local_lock(name).await;
            let local = tokio::time::timeout_at(deadline, local.lock_owned())
                .await
                .map_err(|_| CoordError::LockTimeout {
                    board: name.clone(),
                })?;
            let backend = loop {
                match self.backend.try_lock(name) {
                    Ok(Some(guard)) => break guard,
                    Ok(None) if Instant::now() < deadline => {
                        tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                    }
                    Ok(None) => {
                        return Err(CoordError::LockTimeout {
                            board: name.clone(),
                        });
                    }
                    Err(e) => return Err(CoordError::io(name, e)),
                }
            };
            held.push(HeldLock {
                _local: local,
                _backend: backend,
            });
        }
        Ok(held)
    }

    async fn local_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.local_locks.lock().await;
        // An entry only the map references is neither held nor awaited.
        locks.retain(|board, lock| board == name || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    async fn remember(&self, name: &str, bytes: Vec<u8>) {
        self.snapshots.write().await.insert(name.to_string(), bytes);
    }

    fn ensure_writable(&self, name: &str) -> Result<(), CoordError> {
        match self.quarantine_reason(name)? {
            Some(reason) => Err(CoordError::BoardQuarantined {
                board: name.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Deduplicate and sort board names into the global lock order.
fn lock_order(boards: &[&str]) -> Vec<String> {
    let mut names: Vec<String> = boards.iter().map(|b| b.to_string()).collect();
    names.sort_by(|a, b| lock_rank(a).cmp(&lock_rank(b)));
    names.dedup();
    names
}

fn lock_rank(name: &str) -> (usize, &str) {
    match name.parse::<BoardName>() {
        Ok(board) => (board.rank(), ""),
        Err(_) => (BoardName::ALL.len(), name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Task, TaskId};
    use crate::impls::MemoryBoardStore;
    use crate::store::RetryPolicy;

    fn task(id: &str) -> Task {
        Task::from_new(TaskId::parse(id).unwrap(), NewTask::new(id), Utc::now()).unwrap()
    }

    fn store_with(backend: Arc<MemoryBoardStore>, checkpoint_interval: usize) -> LockedStore {
        let retry = RetryExecutor::new(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        });
        LockedStore::new(backend, retry, Duration::from_millis(30), checkpoint_interval)
    }

    async fn put(store: &LockedStore, board: &str, id: &str) {
        store
            .read_modify_write(board, |b: &mut Board<Task>| {
                b.insert(task(id));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn idle_board_locks_are_pruned() {
        let store = store_with(Arc::new(MemoryBoardStore::new()), 10);
        for n in 0..20 {
            put(&store, &format!("mailbox.w{n}"), "T1").await;
        }
        assert!(store.local_locks.lock().await.len() <= 1);

        let held = store.local_lock("ready").await;
        let _guard = held.lock().await;
        put(&store, "mailbox.w0", "T2").await;
        assert!(store.local_locks.lock().await.contains_key("ready"));
    }

    #[test]
    fn lock_order_puts_task_boards_before_mailboxes() {
        let order = lock_order(&["mailbox.w1", "failed", "backlog", "failed"]);
        assert_eq!(order, vec!["backlog", "failed", "mailbox.w1"]);
    }

    #[tokio::test]
    async fn transact_moves_records_atomically() {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = store_with(backend.clone(), 10);
        put(&store, "ready", "T1").await;

        store
            .transact(&["working", "ready"], |set: &mut BoardSet<Task>| {
                let (ready, working) = set.pair_mut("ready", "working")?;
                let moved = ready.remove("T1").ok_or(CoordError::Unlocked("T1".into()))?;
                working.insert(moved);
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.load::<Task>("ready").await.unwrap().is_empty());
        assert_eq!(store.load::<Task>("working").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closure_errors_leave_boards_untouched() {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = store_with(backend.clone(), 10);
        put(&store, "ready", "T1").await;

        let result: Result<(), CoordError> = store
            .read_modify_write("ready", |b: &mut Board<Task>| {
                b.remove("T1");
                Err(CoordError::InvalidTask("nope".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.load::<Task>("ready").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scope_larger_than_two_boards_is_rejected() {
        let store = store_with(Arc::new(MemoryBoardStore::new()), 10);
        let err = store
            .transact(&["backlog", "ready", "working"], |_: &mut BoardSet<Task>| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::LockScope(3)));
    }

    #[tokio::test]
    async fn failed_second_write_restores_the_first() {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = store_with(backend.clone(), 10);
        put(&store, "ready", "T1").await;
        backend.fail_writes("ready", std::io::ErrorKind::PermissionDenied);

        let err = store
            .transact(&["ready", "working"], |set: &mut BoardSet<Task>| {
                let (ready, working) = set.pair_mut("ready", "working")?;
                let moved = ready.remove("T1").ok_or(CoordError::Unlocked("T1".into()))?;
                working.insert(moved);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordError::Storage { .. }));
        assert!(store.load::<Task>("working").await.unwrap().is_empty());
        assert_eq!(store.load::<Task>("ready").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn held_backend_lock_times_out_and_exhausts_retries() {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = store_with(backend.clone(), 10);
        backend.hold_lock("ready");

        let err = store
            .read_modify_write("ready", |_: &mut Board<Task>| Ok(()))
            .await
            .unwrap_err();
        match err {
            CoordError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, CoordError::LockTimeout { .. }));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupt_board_is_reported_but_snapshot_serves_the_cache() {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = store_with(backend.clone(), 10);
        put(&store, "ready", "T1").await;
        backend.corrupt("ready");

        assert!(matches!(
            store.load::<Task>("ready").await,
            Err(CoordError::BoardCorruption { .. })
        ));
        assert_eq!(store.snapshot::<Task>("ready").await.unwrap().len(), 1);

        let fresh = store_with(backend.clone(), 10);
        assert!(fresh.snapshot::<Task>("ready").await.is_err());
    }

    #[tokio::test]
    async fn repair_replays_the_journal_over_the_backup() {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = store_with(backend.clone(), 2);
        put(&store, "ready", "T1").await;
        put(&store, "ready", "T2").await; // checkpoint
        put(&store, "ready", "T3").await;
        backend.corrupt("ready");

        let outcome = store.repair::<Task>("ready").await.unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Rebuilt {
                records: 3,
                replayed: 1
            }
        );
        let keys: Vec<String> = store
            .load::<Task>("ready")
            .await
            .unwrap()
            .iter()
            .map(Record::key)
            .collect();
        assert_eq!(keys, vec!["T1", "T2", "T3"]);
    }

    #[tokio::test]
    async fn unrecoverable_board_is_quarantined_until_cleared() {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = store_with(backend.clone(), 10);
        backend.inject("ready", b"garbage".to_vec());

        let outcome = store.repair::<Task>("ready").await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Quarantined { .. }));

        let err = store
            .read_modify_write("ready", |_: &mut Board<Task>| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::BoardQuarantined { .. }));

        store.clear_quarantine("ready").await.unwrap();
        backend.inject("ready", b"[]".to_vec());
        put(&store, "ready", "T1").await;
    }

    #[tokio::test]
    async fn healthy_board_is_left_alone() {
        let backend = Arc::new(MemoryBoardStore::new());
        let store = store_with(backend.clone(), 10);
        put(&store, "ready", "T1").await;
        assert_eq!(
            store.repair::<Task>("ready").await.unwrap(),
            RepairOutcome::Healthy
        );
    }
}
