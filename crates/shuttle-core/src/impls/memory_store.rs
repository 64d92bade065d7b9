//! MemoryBoardStore - in-process board backend for tests and embedding.
//!
//! Besides the `BoardStore` contract it exposes fault hooks (corruption,
//! held locks, failing writes) so tests can drive the repair and
//! compensation paths without touching a disk.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Mutex, MutexGuard};

use crate::ports::{BoardLockGuard, BoardStore};

#[derive(Default)]
struct MemoryState {
    boards: HashMap<String, Vec<u8>>,
    backups: HashMap<String, Vec<u8>>,
    journals: HashMap<String, Vec<u8>>,
    quarantine: HashMap<String, String>,

    /// Boards whose lock is held "by another process".
    held: HashSet<String>,

    /// Boards whose main write fails with the given kind.
    failing_writes: HashMap<String, io::ErrorKind>,
}

#[derive(Default)]
pub struct MemoryBoardStore {
    state: Mutex<MemoryState>,
}

impl MemoryBoardStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Overwrite a board with bytes that do not decode.
    pub fn corrupt(&self, board: &str) {
        self.inject(board, b"{\"truncated\": [".to_vec());
    }

    /// Replace a board's raw content, bypassing every check.
    pub fn inject(&self, board: &str, bytes: Vec<u8>) {
        self.state().boards.insert(board.to_string(), bytes);
    }

    pub fn corrupt_backup(&self, board: &str) {
        self.state()
            .backups
            .insert(board.to_string(), b"not json".to_vec());
    }

    pub fn raw(&self, board: &str) -> Option<Vec<u8>> {
        self.state().boards.get(board).cloned()
    }

    pub fn hold_lock(&self, board: &str) {
        self.state().held.insert(board.to_string());
    }

    pub fn release_lock(&self, board: &str) {
        self.state().held.remove(board);
    }

    pub fn fail_writes(&self, board: &str, kind: io::ErrorKind) {
        self.state().failing_writes.insert(board.to_string(), kind);
    }

    pub fn heal_writes(&self, board: &str) {
        self.state().failing_writes.remove(board);
    }
}

impl BoardStore for MemoryBoardStore {
    fn read(&self, board: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.state().boards.get(board).cloned())
    }

    fn write(&self, board: &str, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        if let Some(kind) = state.failing_writes.get(board) {
            return Err(io::Error::new(*kind, format!("injected write failure on {board}")));
        }
        state.boards.insert(board.to_string(), bytes.to_vec());
        Ok(())
    }

    fn try_lock(&self, board: &str) -> io::Result<Option<BoardLockGuard>> {
        if self.state().held.contains(board) {
            return Ok(None);
        }
        Ok(Some(BoardLockGuard::noop()))
    }

    fn read_backup(&self, board: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.state().backups.get(board).cloned())
    }

    fn write_backup(&self, board: &str, bytes: &[u8]) -> io::Result<()> {
        self.state()
            .backups
            .insert(board.to_string(), bytes.to_vec());
        Ok(())
    }

    fn append_journal(&self, board: &str, line: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        let journal = state.journals.entry(board.to_string()).or_default();
        journal.extend_from_slice(line);
        journal.push(b'\n');
        Ok(())
    }

    fn read_journal(&self, board: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.state().journals.get(board).cloned())
    }

    fn clear_journal(&self, board: &str) -> io::Result<()> {
        self.state().journals.remove(board);
        Ok(())
    }

    fn quarantine_reason(&self, board: &str) -> io::Result<Option<String>> {
        Ok(self.state().quarantine.get(board).cloned())
    }

    fn set_quarantine(&self, board: &str, reason: &str) -> io::Result<()> {
        self.state()
            .quarantine
            .insert(board.to_string(), reason.to_string());
        Ok(())
    }

    fn clear_quarantine(&self, board: &str) -> io::Result<()> {
        self.state().quarantine.remove(board);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_boards_read_as_none() {
        let store = MemoryBoardStore::new();
        assert!(store.read("ready").unwrap().is_none());
        store.write("ready", b"[]").unwrap();
        assert_eq!(store.read("ready").unwrap().unwrap(), b"[]");
    }

    #[test]
    fn journal_lines_are_newline_terminated() {
        let store = MemoryBoardStore::new();
        store.append_journal("ready", b"{}").unwrap();
        store.append_journal("ready", b"{}").unwrap();
        assert_eq!(store.read_journal("ready").unwrap().unwrap(), b"{}\n{}\n");
        store.clear_journal("ready").unwrap();
        assert!(store.read_journal("ready").unwrap().is_none());
    }

    #[test]
    fn fault_hooks_affect_only_their_board() {
        let store = MemoryBoardStore::new();
        store.hold_lock("ready");
        store.fail_writes("ready", io::ErrorKind::Interrupted);
        assert!(store.try_lock("ready").unwrap().is_none());
        assert!(store.try_lock("working").unwrap().is_some());
        assert!(store.write("ready", b"[]").is_err());
        assert!(store.write("working", b"[]").is_ok());

        store.release_lock("ready");
        store.heal_writes("ready");
        assert!(store.try_lock("ready").unwrap().is_some());
        assert!(store.write("ready", b"[]").is_ok());
    }
}
