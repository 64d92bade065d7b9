//! Task record: the unit of work tracked across boards.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskStatus, WorkerId};

/// One annotation in a task's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Why a task ended on the `failed` board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    WorkerReported,
    MaxReclaimsExceeded,
}

/// Submission input. The id is optional; one is generated when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }
}

/// A task as persisted on a board.
///
/// Design:
/// - `status` must agree with the board the record sits on.
/// - All mutation goes through the methods below so `updated_at` and the
///   note log stay in step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub priority: i32,
    #[serde(default)]
    pub owner: Option<WorkerId>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reclaim_count: u32,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl Task {
    /// Validate a submission and build the pending record.
    pub fn from_new(id: TaskId, new: NewTask, now: DateTime<Utc>) -> Result<Self, String> {
        if new.title.trim().is_empty() {
            return Err(format!("task {id} has an empty title"));
        }
        let mut dependencies = BTreeSet::new();
        for dep in new.dependencies {
            let dep = TaskId::parse(dep)?;
            if dep == id {
                return Err(format!("task {id} depends on itself"));
            }
            dependencies.insert(dep);
        }
        Ok(Self {
            id,
            title: new.title,
            description: new.description,
            status: TaskStatus::Pending,
            priority: new.priority,
            owner: None,
            dependencies,
            required_capabilities: new.required_capabilities,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            reclaim_count: 0,
            failure_reason: None,
            notes: Vec::new(),
        })
    }

    pub fn add_note(&mut self, text: impl Into<String>, now: DateTime<Utc>) {
        let text = text.into();
        if !text.is_empty() {
            self.notes.push(Note { at: now, text });
        }
        self.updated_at = now;
    }

    pub fn mark_claimed(&mut self, worker: WorkerId, now: DateTime<Utc>) {
        self.status = TaskStatus::Claimed;
        self.owner = Some(worker);
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, reason: FailureReason, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.failure_reason = Some(reason);
        self.updated_at = now;
    }

    /// Back to pending after a release. The owner is cleared.
    pub fn mark_released(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.owner = None;
        self.claimed_at = None;
        self.reclaim_count += 1;
        self.updated_at = now;
    }

    /// Can a worker offering `capabilities` take this task?
    pub fn fits(&self, capabilities: &BTreeSet<String>) -> bool {
        self.required_capabilities.is_subset(capabilities)
    }
}
