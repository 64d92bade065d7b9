//! Dispatch - typed events from producers to subscribers.
//!
//! - **HandlerRegistry**: event type -> handlers
//! - **EventDispatcher**: priority queue + background delivery loop; the
//!   production `EventSink`

pub mod dispatcher;
pub mod handler;

pub use self::dispatcher::EventDispatcher;
pub use self::handler::{
    EventHandler, HandlerError, HandlerRegistry, SubscriptionHandle, handler_fn,
};
