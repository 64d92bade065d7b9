//! Error taxonomy shared by every layer of the engine.
//!
//! Callers of the facade only ever see `CoordError`. `kind()` groups the
//! variants so callers (CLIs, monitors) can branch on the class rather than
//! on individual variants.

use std::io;

use thiserror::Error;

use crate::domain::{MessageId, TaskId, TaskStatus};

/// Operational classification of a `CoordError`.
///
/// - Transient: retried by `RetryExecutor`, surfaced only once retries run out.
/// - Conflict: the caller lost a race or asked for something the state forbids.
/// - Corruption: a persisted board is unreadable; writes stop until repair.
/// - Protocol: malformed input rejected at the boundary.
/// - Fatal: storage or configuration is broken; no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Conflict,
    Corruption,
    Protocol,
    Fatal,
}

#[derive(Debug, Error)]
pub enum CoordError {
    // transient
    #[error("timed out acquiring lock on board {board}")]
    LockTimeout { board: String },

    #[error("transient i/o failure on board {board}: {source}")]
    TransientIo {
        board: String,
        #[source]
        source: io::Error,
    },

    // conflict
    #[error("task {0} already exists")]
    DuplicateId(TaskId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {task_id} is on board {actual}, expected {expected}")]
    WrongBoard {
        task_id: TaskId,
        expected: String,
        actual: String,
    },

    #[error("task {task_id} cannot be claimed: {reason}")]
    TaskNotClaimable { task_id: TaskId, reason: String },

    #[error("task {task_id}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {0} is already terminal")]
    TaskAlreadyTerminal(TaskId),

    #[error("task {task_id} has unresolved dependencies: {pending:?}")]
    DependencyUnresolved {
        task_id: TaskId,
        pending: Vec<TaskId>,
    },

    #[error("no claimable task for worker {worker_id}")]
    NoClaimableTask { worker_id: String },

    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    // corruption
    #[error("board {board} is corrupted: {detail}")]
    BoardCorruption { board: String, detail: String },

    #[error("board {board} is quarantined: {reason}")]
    BoardQuarantined { board: String, reason: String },

    // protocol
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    // fatal
    #[error("storage failure on board {board}: {source}")]
    Storage {
        board: String,
        #[source]
        source: io::Error,
    },

    #[error("lock scope over {0} boards exceeds the two-board limit")]
    LockScope(usize),

    #[error("board {0} accessed outside its lock scope")]
    Unlocked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<CoordError>,
    },
}

impl CoordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordError::LockTimeout { .. } | CoordError::TransientIo { .. } => ErrorKind::Transient,

            CoordError::DuplicateId(_)
            | CoordError::TaskNotFound(_)
            | CoordError::WrongBoard { .. }
            | CoordError::TaskNotClaimable { .. }
            | CoordError::InvalidTransition { .. }
            | CoordError::TaskAlreadyTerminal(_)
            | CoordError::DependencyUnresolved { .. }
            | CoordError::NoClaimableTask { .. }
            | CoordError::MessageNotFound(_) => ErrorKind::Conflict,

            CoordError::BoardCorruption { .. } | CoordError::BoardQuarantined { .. } => {
                ErrorKind::Corruption
            }

            CoordError::MalformedMessage(_)
            | CoordError::UnknownEventType(_)
            | CoordError::InvalidTask(_) => ErrorKind::Protocol,

            CoordError::Storage { .. }
            | CoordError::LockScope(_)
            | CoordError::Unlocked(_)
            | CoordError::Config(_)
            | CoordError::RetryExhausted { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Wrap an I/O error, splitting transient kinds from hard failures.
    pub(crate) fn io(board: &str, source: io::Error) -> Self {
        let board = board.to_string();
        match source.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                CoordError::TransientIo { board, source }
            }
            _ => CoordError::Storage { board, source },
        }
    }

    pub(crate) fn corruption(board: &str, detail: impl ToString) -> Self {
        CoordError::BoardCorruption {
            board: board.to_string(),
            detail: detail.to_string(),
        }
    }
}
