//! Events - state-change notifications
//!
//! Events live only in the dispatcher's in-memory queue; they are never
//! persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskSubmitted,
    TaskPromoted,
    TaskClaimed,
    TaskUpdated,
    TaskCompleted,
    TaskFailed,
    TaskReleased,
    MessageSent,
    MessageAcked,
    BoardRepaired,
    BoardQuarantined,
    SystemError,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::TaskSubmitted,
        EventType::TaskPromoted,
        EventType::TaskClaimed,
        EventType::TaskUpdated,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::TaskReleased,
        EventType::MessageSent,
        EventType::MessageAcked,
        EventType::BoardRepaired,
        EventType::BoardQuarantined,
        EventType::SystemError,
    ];

    /// Priority used when the producer does not pick one (lower = sooner).
    pub fn default_priority(self) -> i32 {
        match self {
            EventType::SystemError | EventType::BoardQuarantined => 0,
            EventType::TaskFailed | EventType::TaskReleased => 2,
            EventType::TaskCompleted | EventType::BoardRepaired => 3,
            EventType::TaskClaimed => 4,
            EventType::TaskPromoted | EventType::TaskUpdated => 5,
            EventType::TaskSubmitted | EventType::MessageSent => 6,
            EventType::MessageAcked => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TaskSubmitted => "TASK_SUBMITTED",
            EventType::TaskPromoted => "TASK_PROMOTED",
            EventType::TaskClaimed => "TASK_CLAIMED",
            EventType::TaskUpdated => "TASK_UPDATED",
            EventType::TaskCompleted => "TASK_COMPLETED",
            EventType::TaskFailed => "TASK_FAILED",
            EventType::TaskReleased => "TASK_RELEASED",
            EventType::MessageSent => "MESSAGE_SENT",
            EventType::MessageAcked => "MESSAGE_ACKED",
            EventType::BoardRepaired => "BOARD_REPAIRED",
            EventType::BoardQuarantined => "BOARD_QUARANTINED",
            EventType::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_uppercase().replace('-', "_");
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source_id: String,
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, source_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            source_id: source_id.into(),
            priority: event_type.default_priority(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_its_name() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>(), Ok(t));
        }
        assert_eq!("task-claimed".parse::<EventType>(), Ok(EventType::TaskClaimed));
        assert_eq!("NOPE".parse::<EventType>(), Err("NOPE".to_string()));
    }

    #[test]
    fn system_errors_outrank_everything() {
        let min = EventType::ALL
            .into_iter()
            .map(EventType::default_priority)
            .min()
            .unwrap();
        assert_eq!(EventType::SystemError.default_priority(), min);
    }
}
