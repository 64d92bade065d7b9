//! Mailbox - per-worker message boards with at-least-once delivery.
//!
//! Each recipient owns the board `mailbox.<worker_id>`. `receive` hands out
//! every message not yet acknowledged, in arrival order, and keeps handing it
//! out until `ack` removes it.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::domain::{Event, EventType, Message, MessageId, WorkerId};
use crate::error::CoordError;
use crate::ports::{Clock, EventSink};
use crate::store::{Board, LockedStore, RepairOutcome};

pub const MAILBOX_PREFIX: &str = "mailbox.";

pub fn board_name(worker: &WorkerId) -> String {
    format!("{MAILBOX_PREFIX}{worker}")
}

pub struct Mailbox {
    store: Arc<LockedStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    max_message_bytes: usize,
}

impl Mailbox {
    pub fn new(
        store: Arc<LockedStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            max_message_bytes,
        }
    }

    pub async fn send(&self, message: Message) -> Result<MessageId, CoordError> {
        message
            .validate(self.max_message_bytes)
            .map_err(CoordError::MalformedMessage)?;
        let board = board_name(&message.recipient_id);

        self.store
            .read_modify_write(&board, |mailbox: &mut Board<Message>| {
                if mailbox.insert(message.clone()) {
                    Ok(())
                } else {
                    Err(CoordError::MalformedMessage(format!(
                        "message {} already delivered",
                        message.message_id
                    )))
                }
            })
            .await?;

        debug!(message_id = %message.message_id, recipient = %message.recipient_id, "message sent");
        self.emit(
            EventType::MessageSent,
            message.sender_id.as_str(),
            json!({
                "message_id": message.message_id,
                "sender_id": message.sender_id,
                "recipient_id": message.recipient_id,
                "type": message.message_type,
                "priority": message.priority,
            }),
        );
        Ok(message.message_id)
    }

    /// Parse a raw wire message and send it.
    pub async fn send_json(&self, raw: &str) -> Result<MessageId, CoordError> {
        let message = Message::from_json(raw).map_err(CoordError::MalformedMessage)?;
        self.send(message).await
    }

    /// Every unacknowledged message, oldest first. Counts as a delivery.
    pub async fn receive(&self, worker: &WorkerId) -> Result<Vec<Message>, CoordError> {
        self.store
            .read_modify_write(&board_name(worker), |mailbox: &mut Board<Message>| {
                let keys: Vec<String> = mailbox
                    .records()
                    .iter()
                    .map(|m| m.message_id.to_string())
                    .collect();
                let mut delivered = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Some(message) = mailbox.update(&key, |m| {
                        m.deliveries += 1;
                        m.clone()
                    }) {
                        delivered.push(message);
                    }
                }
                Ok(delivered)
            })
            .await
    }

    /// Unacknowledged messages, without counting a delivery.
    pub async fn peek(&self, worker: &WorkerId) -> Result<Vec<Message>, CoordError> {
        self.store.snapshot(&board_name(worker)).await
    }

    pub async fn ack(&self, worker: &WorkerId, message_id: MessageId) -> Result<Message, CoordError> {
        let key = message_id.to_string();
        let message = self
            .store
            .read_modify_write(&board_name(worker), |mailbox: &mut Board<Message>| {
                mailbox
                    .remove(&key)
                    .ok_or(CoordError::MessageNotFound(message_id))
            })
            .await?;

        self.emit(
            EventType::MessageAcked,
            worker.as_str(),
            json!({ "message_id": message_id, "worker_id": worker }),
        );
        Ok(message)
    }

    /// Rebuild a worker's mailbox from its backup and journal.
    pub async fn repair(&self, worker: &WorkerId) -> Result<RepairOutcome, CoordError> {
        let board = board_name(worker);
        let outcome = self.store.repair::<Message>(&board).await?;
        match &outcome {
            RepairOutcome::Healthy => {}
            RepairOutcome::Rebuilt { records, replayed } => self.emit(
                EventType::BoardRepaired,
                &board,
                json!({ "board": board, "records": records, "replayed": replayed }),
            ),
            RepairOutcome::Quarantined { reason } => self.emit(
                EventType::BoardQuarantined,
                &board,
                json!({ "board": board, "reason": reason }),
            ),
        }
        Ok(outcome)
    }

    pub async fn clear_quarantine(&self, worker: &WorkerId) -> Result<(), CoordError> {
        let board = board_name(worker);
        self.store.clear_quarantine(&board).await?;
        self.emit(
            EventType::BoardRepaired,
            &board,
            json!({ "board": board, "quarantine_cleared": true }),
        );
        Ok(())
    }

    fn emit(&self, event_type: EventType, source_id: &str, payload: serde_json::Value) {
        self.events
            .emit(Event::new(event_type, source_id, payload).at(self.clock.now()));
    }
}
