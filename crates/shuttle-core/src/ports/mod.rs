//! Ports - the seams between the engine and its environment
//!
//! Each trait hides one external dependency (storage, time, id generation,
//! event delivery) so tests can swap in deterministic implementations.

pub mod board_store;
pub mod clock;
pub mod event_sink;
pub mod id_generator;

pub use self::board_store::{BoardLockGuard, BoardStore};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{CollectingEventSink, EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
