//! Status - health view over the task boards.

use serde::Serialize;

use crate::domain::BoardName;
use crate::observability::BoardCounts;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardStatus {
    pub board: BoardName,
    /// `None` when the board could not be read.
    pub tasks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<String>,
}

impl BoardStatus {
    pub fn readable(board: BoardName, tasks: usize, quarantine: Option<String>) -> Self {
        Self {
            board,
            tasks: Some(tasks),
            error: None,
            quarantine,
        }
    }

    pub fn unreadable(board: BoardName, error: String, quarantine: Option<String>) -> Self {
        Self {
            board,
            tasks: None,
            error: Some(error),
            quarantine,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.error.is_none() && self.quarantine.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub boards: Vec<BoardStatus>,
    /// Counts over the readable boards.
    pub counts: BoardCounts,
    pub pending_events: usize,
    pub healthy: bool,
}

impl StatusReport {
    pub fn new(boards: Vec<BoardStatus>, pending_events: usize) -> Self {
        let mut counts = BoardCounts::default();
        for status in &boards {
            if let Some(tasks) = status.tasks {
                counts.set(status.board, tasks);
            }
        }
        let healthy = boards.iter().all(BoardStatus::is_healthy);
        Self {
            boards,
            counts,
            pending_events,
            healthy,
        }
    }

    pub fn board(&self, board: BoardName) -> Option<&BoardStatus> {
        self.boards.iter().find(|s| s.board == board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_sums_readable_boards_only() {
        let report = StatusReport::new(
            vec![
                BoardStatus::readable(BoardName::Ready, 2, None),
                BoardStatus::unreadable(BoardName::Working, "bad json".into(), None),
                BoardStatus::readable(BoardName::Failed, 1, Some("no backup".into())),
            ],
            0,
        );
        assert_eq!(report.counts.total(), 3);
        assert!(!report.healthy);
        assert!(report.board(BoardName::Ready).unwrap().is_healthy());
        assert!(report.board(BoardName::Backlog).is_none());
    }
}
