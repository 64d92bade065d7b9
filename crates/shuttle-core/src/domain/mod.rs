//! Domain model (ids, tasks, statuses, messages, events).

pub mod events;
pub mod ids;
pub mod message;
pub mod outcome;
pub mod state;
pub mod task;

pub use self::events::{Event, EventType};
pub use self::ids::{Id, IdMarker, TaskId, WorkerId};
pub use self::message::{Message, MessageId, MessagePriority, MessageType};
pub use self::outcome::Outcome;
pub use self::state::{BoardName, TaskStatus};
pub use self::task::{FailureReason, NewTask, Note, Task};
