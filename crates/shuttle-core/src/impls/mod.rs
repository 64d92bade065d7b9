//! Impls - `BoardStore` backends.
//!
//! - **FileBoardStore**: a directory of JSON files, shared between processes
//!   through advisory locks.
//! - **MemoryBoardStore**: in-process maps with fault hooks for tests.

pub mod file_store;
pub mod memory_store;

pub use self::file_store::FileBoardStore;
pub use self::memory_store::MemoryBoardStore;
