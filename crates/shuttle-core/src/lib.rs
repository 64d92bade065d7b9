//! shuttle-core
//!
//! A task coordination engine: many workers claim, update and hand off
//! tasks kept on shared boards, and subscribers receive ordered events about
//! every transition.
//!
//! # Modules
//! - **domain**: ids, tasks, statuses, messages, events
//! - **ports**: seams to the environment (BoardStore, Clock, IdGenerator, EventSink)
//! - **impls**: BoardStore backends (file, memory)
//! - **store**: locking, journaling, repair and retry over a backend
//! - **registry**: task lifecycle as atomic moves between boards
//! - **dispatch**: prioritized in-process event delivery
//! - **mailbox**: per-worker messages with at-least-once delivery
//! - **app**: the Coordinator facade, its builder and the reaper
//! - **config**, **error**, **observability**: ambient concerns

pub mod app;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod impls;
pub mod mailbox;
pub mod observability;
pub mod ports;
pub mod registry;
pub mod store;

pub use crate::app::{BoardRef, BuildError, ClaimFilter, Coordinator, CoordinatorBuilder, ReaperLoop};
pub use crate::config::EngineConfig;
pub use crate::error::{CoordError, ErrorKind};
