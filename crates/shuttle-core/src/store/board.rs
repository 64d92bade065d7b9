//! Board - a named, ordered collection of records.
//!
//! Boards are loaded and handed to transaction closures by `LockedStore`; a
//! `Board` value is only ever a working copy of one locked collection.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Message, Task};
use crate::error::CoordError;

/// Anything that can live on a board.
///
/// `key()` must be unique within a board; the journal identifies records by it.
pub trait Record: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {
    fn key(&self) -> String;
}

impl Record for Task {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for Message {
    fn key(&self) -> String {
        self.message_id.to_string()
    }
}

/// Working copy of one board inside a transaction.
///
/// Insertion order is preserved; it is the FIFO tie-break for equal
/// priorities.
#[derive(Debug, Clone)]
pub struct Board<T> {
    name: String,
    records: Vec<T>,
    dirty: bool,
}

impl<T: Record> Board<T> {
    pub fn new(name: impl Into<String>, records: Vec<T>) -> Self {
        Self {
            name: name.into(),
            records,
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether anything was changed since the board was loaded.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.records.iter().position(|r| r.key() == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn find(&self, key: &str) -> Option<&T> {
        self.records.iter().find(|r| r.key() == key)
    }

    /// Append a record. Returns `false` (and changes nothing) if the key is
    /// already present.
    pub fn insert(&mut self, record: T) -> bool {
        if self.contains(&record.key()) {
            return false;
        }
        self.records.push(record);
        self.dirty = true;
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        let index = self.position(key)?;
        self.dirty = true;
        Some(self.records.remove(index))
    }

    /// Swap in a new version of an existing record, keeping its position.
    pub fn replace(&mut self, record: T) -> Option<T> {
        let index = self.position(&record.key())?;
        self.dirty = true;
        Some(std::mem::replace(&mut self.records[index], record))
    }

    /// Mutate a record in place.
    pub fn update<R>(&mut self, key: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let index = self.position(key)?;
        self.dirty = true;
        Some(f(&mut self.records[index]))
    }
}

/// The boards locked by one transaction.
#[derive(Debug)]
pub struct BoardSet<T> {
    boards: Vec<Board<T>>,
}

impl<T: Record> BoardSet<T> {
    pub(crate) fn new(boards: Vec<Board<T>>) -> Self {
        Self { boards }
    }

    pub(crate) fn into_boards(self) -> Vec<Board<T>> {
        self.boards
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.boards.iter().map(Board::name)
    }

    pub fn get(&self, name: &str) -> Result<&Board<T>, CoordError> {
        self.boards
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| CoordError::Unlocked(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Board<T>, CoordError> {
        self.boards
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| CoordError::Unlocked(name.to_string()))
    }

    /// Two distinct boards, mutably, in the order asked for.
    pub fn pair_mut(
        &mut self,
        first: &str,
        second: &str,
    ) -> Result<(&mut Board<T>, &mut Board<T>), CoordError> {
        let i = self.index_of(first)?;
        let j = self.index_of(second)?;
        if i == j {
            return Err(CoordError::Unlocked(format!("{first} (requested twice)")));
        }
        if i < j {
            let (head, tail) = self.boards.split_at_mut(j);
            Ok((&mut head[i], &mut tail[0]))
        } else {
            let (head, tail) = self.boards.split_at_mut(i);
            Ok((&mut tail[0], &mut head[j]))
        }
    }

    fn index_of(&self, name: &str) -> Result<usize, CoordError> {
        self.boards
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| CoordError::Unlocked(name.to_string()))
    }
}

/// Decode a persisted board. Zero-length content counts as corruption: an
/// absent board is reported by the backend as `None`, never as empty bytes.
pub(crate) fn decode<T: Record>(board: &str, bytes: &[u8]) -> Result<Vec<T>, CoordError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(CoordError::corruption(board, "board file is empty"));
    }
    serde_json::from_slice(bytes).map_err(|e| CoordError::corruption(board, e))
}

pub(crate) fn encode<T: Record>(board: &str, records: &[T]) -> Result<Vec<u8>, CoordError> {
    serde_json::to_vec_pretty(records).map_err(|e| CoordError::Storage {
        board: board.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, TaskId};
    use chrono::Utc;

    fn task(id: &str) -> Task {
        Task::from_new(TaskId::parse(id).unwrap(), NewTask::new(id), Utc::now()).unwrap()
    }

    #[test]
    fn insert_rejects_duplicate_keys() {
        let mut board = Board::new("backlog", vec![task("T1")]);
        assert!(!board.insert(task("T1")));
        assert!(!board.is_dirty());
        assert!(board.insert(task("T2")));
        assert!(board.is_dirty());
        assert_eq!(board.len(), 2);
    }

    #[test]
    fn replace_keeps_position() {
        let mut board = Board::new("ready", vec![task("T1"), task("T2"), task("T3")]);
        let mut changed = task("T2");
        changed.priority = 9;
        assert!(board.replace(changed).is_some());
        assert_eq!(board.position("T2"), Some(1));
        assert_eq!(board.find("T2").unwrap().priority, 9);
        assert!(board.replace(task("T9")).is_none());
    }

    #[test]
    fn untouched_board_stays_clean() {
        let mut board = Board::new("ready", vec![task("T1")]);
        assert!(board.remove("T9").is_none());
        assert!(board.update("T9", |t| t.priority = 1).is_none());
        assert!(!board.is_dirty());
    }

    #[test]
    fn pair_mut_returns_boards_in_requested_order() {
        let mut set = BoardSet::new(vec![
            Board::new("ready", vec![task("T1")]),
            Board::new("working", Vec::new()),
        ]);
        let (working, ready) = set.pair_mut("working", "ready").unwrap();
        let moved = ready.remove("T1").unwrap();
        working.insert(moved);
        assert_eq!(set.get("working").unwrap().len(), 1);
        assert!(set.get("ready").unwrap().is_empty());
    }

    #[test]
    fn boards_outside_the_scope_are_unreachable() {
        let mut set: BoardSet<Task> = BoardSet::new(vec![Board::new("ready", Vec::new())]);
        assert!(matches!(set.get_mut("failed"), Err(CoordError::Unlocked(_))));
        assert!(matches!(
            set.pair_mut("ready", "ready"),
            Err(CoordError::Unlocked(_))
        ));
    }

    #[test]
    fn decode_flags_garbage_and_empty_content() {
        assert!(decode::<Task>("ready", b"[]").unwrap().is_empty());
        assert!(matches!(
            decode::<Task>("ready", b"{not json"),
            Err(CoordError::BoardCorruption { .. })
        ));
        assert!(matches!(
            decode::<Task>("ready", b""),
            Err(CoordError::BoardCorruption { .. })
        ));
    }
}
