use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Event, EventType};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber for one or more event types.
///
/// A returned error (or a panic) is reported as a `SYSTEM_ERROR` event; it
/// never stops delivery to other handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Returned by `register`; pass it back to `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub event_type: EventType,
    id: u64,
}

/// event_type -> handlers, in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Vec<(u64, Arc<dyn EventHandler>)>>,
    next_id: u64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.handlers
            .entry(event_type)
            .or_default()
            .push((id, handler));
        SubscriptionHandle { event_type, id }
    }

    /// Returns `false` if the handle was already gone.
    pub fn unregister(&mut self, handle: SubscriptionHandle) -> bool {
        let Some(list) = self.handlers.get_mut(&handle.event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(&handle.event_type);
        }
        removed
    }

    /// Snapshot of the handlers for one type, so delivery holds no lock.
    pub fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .get(&event_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn EventHandler> {
        handler_fn(|_event| async { Ok::<(), HandlerError>(()) })
    }

    #[test]
    fn handlers_are_kept_per_type_in_order() {
        let mut reg = HandlerRegistry::new();
        reg.register(EventType::TaskClaimed, noop());
        reg.register(EventType::TaskClaimed, noop());
        reg.register(EventType::TaskFailed, noop());

        assert_eq!(reg.handlers_for(EventType::TaskClaimed).len(), 2);
        assert!(reg.handlers_for(EventType::MessageSent).is_empty());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn unregister_removes_only_that_subscription() {
        let mut reg = HandlerRegistry::new();
        let first = reg.register(EventType::TaskClaimed, noop());
        reg.register(EventType::TaskClaimed, noop());

        assert!(reg.unregister(first));
        assert!(!reg.unregister(first));
        assert_eq!(reg.handlers_for(EventType::TaskClaimed).len(), 1);
    }

    #[tokio::test]
    async fn handler_fn_passes_the_event_through() {
        let handler = handler_fn(|event: Event| async move {
            if event.source_id == "bad" {
                Err::<(), HandlerError>("refused".into())
            } else {
                Ok(())
            }
        });
        let ok = Event::new(EventType::TaskClaimed, "T1", serde_json::json!({}));
        let bad = Event::new(EventType::TaskClaimed, "bad", serde_json::json!({}));
        assert!(handler.handle(&ok).await.is_ok());
        assert!(handler.handle(&bad).await.is_err());
    }
}
