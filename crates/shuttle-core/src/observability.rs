use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::domain::BoardName;

/// Number of tasks on each board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardCounts {
    pub backlog: usize,
    pub ready: usize,
    pub working: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BoardCounts {
    pub fn set(&mut self, board: BoardName, count: usize) {
        match board {
            BoardName::Backlog => self.backlog = count,
            BoardName::Ready => self.ready = count,
            BoardName::Working => self.working = count,
            BoardName::Completed => self.completed = count,
            BoardName::Failed => self.failed = count,
        }
    }

    pub fn get(&self, board: BoardName) -> usize {
        match board {
            BoardName::Backlog => self.backlog,
            BoardName::Ready => self.ready,
            BoardName::Working => self.working,
            BoardName::Completed => self.completed,
            BoardName::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        BoardName::ALL.into_iter().map(|b| self.get(b)).sum()
    }
}

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
