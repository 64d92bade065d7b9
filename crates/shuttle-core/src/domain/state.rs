//! Task status and the boards that hold each status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task.
///
/// State transitions:
/// - Pending -> Claimed -> InProgress <-> Blocked
/// - Claimed | InProgress | Blocked -> Completed | Failed
/// - Claimed | InProgress | Blocked -> Pending (release)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Held by a worker (lives on the `working` board).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Claimed | TaskStatus::InProgress | TaskStatus::Blocked
        )
    }

    /// Progress transitions a worker may report through `update`.
    pub fn can_progress_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Claimed, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::Blocked, TaskStatus::InProgress)
        )
    }

    pub fn can_finish_as(self, terminal: TaskStatus) -> bool {
        match terminal {
            TaskStatus::Completed | TaskStatus::Failed => self.is_active(),
            _ => false,
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "CLAIMED" => Ok(TaskStatus::Claimed),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "BLOCKED" => Ok(TaskStatus::Blocked),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// The five task boards.
///
/// The derived `Ord` is the global lock-acquisition order:
/// backlog < ready < working < completed < failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardName {
    Backlog,
    Ready,
    Working,
    Completed,
    Failed,
}

impl BoardName {
    pub const ALL: [BoardName; 5] = [
        BoardName::Backlog,
        BoardName::Ready,
        BoardName::Working,
        BoardName::Completed,
        BoardName::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BoardName::Backlog => "backlog",
            BoardName::Ready => "ready",
            BoardName::Working => "working",
            BoardName::Completed => "completed",
            BoardName::Failed => "failed",
        }
    }

    /// Position in the global lock order.
    pub fn rank(self) -> usize {
        self as usize
    }

    /// Whether a task with `status` may live on this board.
    pub fn admits(self, status: TaskStatus) -> bool {
        match self {
            BoardName::Backlog | BoardName::Ready => status == TaskStatus::Pending,
            BoardName::Working => status.is_active(),
            BoardName::Completed => status == TaskStatus::Completed,
            BoardName::Failed => status == TaskStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BoardName::Completed | BoardName::Failed)
    }
}

impl fmt::Display for BoardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoardName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BoardName::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| format!("unknown board: {s}"))
    }
}
