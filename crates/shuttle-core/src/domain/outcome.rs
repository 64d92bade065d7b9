//! Outcome reported by a worker when it finishes a task.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{BoardName, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    pub fn status(self) -> TaskStatus {
        match self {
            Outcome::Completed => TaskStatus::Completed,
            Outcome::Failed => TaskStatus::Failed,
        }
    }

    pub fn board(self) -> BoardName {
        match self {
            Outcome::Completed => BoardName::Completed,
            Outcome::Failed => BoardName::Failed,
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "completed" | "complete" | "success" => Ok(Outcome::Completed),
            "failed" | "fail" | "failure" => Ok(Outcome::Failed),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}
