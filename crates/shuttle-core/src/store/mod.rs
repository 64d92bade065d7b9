//! Store - locking, journaling and retry over raw board backends.

pub mod board;
pub mod journal;
pub mod locked;
pub mod retry;

pub use self::board::{Board, BoardSet, Record};
pub use self::journal::{JournalEntry, JournalOp};
pub use self::locked::{LockedStore, MAX_LOCK_SCOPE, RepairOutcome};
pub use self::retry::{RetryExecutor, RetryPolicy};
