//! Mutation journal.
//!
//! One JSON line per committed transaction per board, listing the records it
//! upserted or deleted. Replaying the journal over the last backup (or over an
//! empty board, before the first checkpoint) rebuilds the board.
//!
//! Replay is idempotent: a put replaces the record in place or appends it, a
//! delete of a missing key is a no-op. A crash between writing a checkpoint
//! and truncating the journal is therefore harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::board::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    Put { key: String, record: Value },
    Delete { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub ops: Vec<JournalOp>,
}

impl JournalEntry {
    pub fn new(at: DateTime<Utc>, ops: Vec<JournalOp>) -> Self {
        Self { at, ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ops turning `before` into `after`.
///
/// Records never move within a board (they are appended, edited in place or
/// removed), so deletes followed by puts in `after` order reproduce `after`
/// exactly.
pub fn diff<T: Record>(before: &[T], after: &[T]) -> Result<Vec<JournalOp>, serde_json::Error> {
    let mut ops = Vec::new();
    for old in before {
        let key = old.key();
        if !after.iter().any(|r| r.key() == key) {
            ops.push(JournalOp::Delete { key });
        }
    }
    for new in after {
        let key = new.key();
        let unchanged = before.iter().any(|r| r.key() == key && r == new);
        if !unchanged {
            ops.push(JournalOp::Put {
                key,
                record: serde_json::to_value(new)?,
            });
        }
    }
    Ok(ops)
}

pub fn replay<T: Record>(records: &mut Vec<T>, entry: &JournalEntry) -> Result<(), serde_json::Error> {
    for op in &entry.ops {
        match op {
            JournalOp::Put { key, record } => {
                let record: T = serde_json::from_value(record.clone())?;
                match records.iter().position(|r| &r.key() == key) {
                    Some(index) => records[index] = record,
                    None => records.push(record),
                }
            }
            JournalOp::Delete { key } => records.retain(|r| &r.key() != key),
        }
    }
    Ok(())
}

/// Parse journal content.
///
/// A final line without its terminating newline is a torn append from a crash
/// and is dropped if it does not parse. Any other bad line is an error.
pub fn parse(bytes: &[u8]) -> Result<Vec<JournalEntry>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("journal is not utf-8: {e}"))?;
    let complete = text.ends_with('\n');
    let lines: Vec<&str> = text.lines().collect();
    let mut entries = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) if !complete && index + 1 == lines.len() => {
                tracing::warn!(line = index + 1, "dropping torn journal tail");
            }
            Err(e) => return Err(format!("journal line {}: {e}", index + 1)),
        }
    }
    Ok(entries)
}

pub fn count_lines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\n').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Task, TaskId};

    fn task(id: &str, priority: i32) -> Task {
        Task::from_new(
            TaskId::parse(id).unwrap(),
            NewTask::new(id).with_priority(priority),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn diff_then_replay_reproduces_the_board() {
        let before = vec![task("T1", 1), task("T2", 2), task("T3", 3)];
        let mut after = before.clone();
        after.remove(0);
        after[0].priority = 7;
        after.push(task("T4", 4));

        let ops = diff(&before, &after).unwrap();
        assert_eq!(ops.len(), 3);

        let mut rebuilt = before.clone();
        replay(&mut rebuilt, &JournalEntry::new(Utc::now(), ops)).unwrap();
        assert_eq!(rebuilt, after);
    }

    #[test]
    fn unchanged_boards_produce_no_ops() {
        let before = vec![task("T1", 1)];
        assert!(diff(&before, &before.clone()).unwrap().is_empty());
    }

    #[test]
    fn replay_is_idempotent() {
        let entry = JournalEntry::new(
            Utc::now(),
            vec![
                JournalOp::Put {
                    key: "T1".into(),
                    record: serde_json::to_value(task("T1", 1)).unwrap(),
                },
                JournalOp::Delete { key: "T0".into() },
            ],
        );
        let mut once: Vec<Task> = Vec::new();
        replay(&mut once, &entry).unwrap();
        let mut twice = once.clone();
        replay(&mut twice, &entry).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn parse_drops_only_a_torn_tail() {
        let entry = JournalEntry::new(Utc::now(), vec![JournalOp::Delete { key: "T1".into() }]);
        let line = serde_json::to_string(&entry).unwrap();

        let torn = format!("{line}\n{{\"at\":");
        assert_eq!(parse(torn.as_bytes()).unwrap().len(), 1);

        let broken_middle = format!("{{\"at\":\n{line}\n");
        assert!(parse(broken_middle.as_bytes()).is_err());
    }
}
