//! BoardStore port - raw persistence for named boards
//!
//! A backend stores bytes; it knows nothing about records. `LockedStore`
//! layers locking, parsing, journaling and repair on top.
//!
//! # Contract
//! - `write` replaces the whole board atomically (readers never see a torn
//!   write).
//! - `try_lock` never blocks: it returns `None` while another holder has the
//!   board. Process-local exclusion is `LockedStore`'s job; backends only
//!   need to add cross-process exclusion if they have any.
//! - An absent board reads as `None`.

use std::fs::File;
use std::io;

pub trait BoardStore: Send + Sync {
    fn read(&self, board: &str) -> io::Result<Option<Vec<u8>>>;

    fn write(&self, board: &str, bytes: &[u8]) -> io::Result<()>;

    fn try_lock(&self, board: &str) -> io::Result<Option<BoardLockGuard>>;

    fn read_backup(&self, board: &str) -> io::Result<Option<Vec<u8>>>;

    fn write_backup(&self, board: &str, bytes: &[u8]) -> io::Result<()>;

    /// Append one line to the board's mutation journal.
    fn append_journal(&self, board: &str, line: &[u8]) -> io::Result<()>;

    fn read_journal(&self, board: &str) -> io::Result<Option<Vec<u8>>>;

    fn clear_journal(&self, board: &str) -> io::Result<()>;

    fn quarantine_reason(&self, board: &str) -> io::Result<Option<String>>;

    fn set_quarantine(&self, board: &str, reason: &str) -> io::Result<()>;

    fn clear_quarantine(&self, board: &str) -> io::Result<()>;
}

/// Cross-process lock held for the duration of one transaction.
///
/// File-backed locks are released when the handle closes.
#[derive(Debug)]
pub struct BoardLockGuard {
    _file: Option<File>,
}

impl BoardLockGuard {
    pub fn file(file: File) -> Self {
        Self { _file: Some(file) }
    }

    /// For backends with no cross-process dimension.
    pub fn noop() -> Self {
        Self { _file: None }
    }
}
