//! App - the application layer.
//!
//! Composes the store, registry, mailbox and dispatcher into the public
//! facade.
//!
//! # Components
//! - **CoordinatorBuilder**: wiring and start-up validation
//! - **Coordinator**: the facade external callers use
//! - **ReaperLoop**: periodic release of stale claims
//! - **StatusReport**: per-board health view

pub mod builder;
pub mod coordinator;
pub mod reaper_loop;
pub mod status;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::{BoardRef, ClaimFilter, Coordinator};
pub use self::reaper_loop::ReaperLoop;
pub use self::status::{BoardStatus, StatusReport};
