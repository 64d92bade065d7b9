//! Mailbox message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("invalid message id {s:?}: {e}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Directive,
    StatusUpdate,
    ErrorReport,
    Acknowledgement,
    RequestForInfo,
    Result,
    CoordinationRequest,
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let quoted = format!("\"{}\"", s.to_ascii_uppercase().replace('-', "_"));
        serde_json::from_str(&quoted).map_err(|_| format!("unknown message type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl FromStr for MessagePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(MessagePriority::Critical),
            "HIGH" => Ok(MessagePriority::High),
            "MEDIUM" => Ok(MessagePriority::Medium),
            "LOW" => Ok(MessagePriority::Low),
            other => Err(format!("unknown message priority: {other}")),
        }
    }
}

/// A directed message between workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub sender_id: WorkerId,
    pub recipient_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub response_to: Option<MessageId>,
    /// Times a poll has handed this message out without an ack.
    #[serde(default)]
    pub deliveries: u32,
}

impl Message {
    pub fn new(
        sender_id: WorkerId,
        recipient_id: WorkerId,
        message_type: MessageType,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            sender_id,
            recipient_id,
            timestamp: Utc::now(),
            message_type,
            subject: subject.into(),
            body: body.into(),
            priority: MessagePriority::default(),
            response_to: None,
            deliveries: 0,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_reply_to(mut self, message_id: MessageId) -> Self {
        self.response_to = Some(message_id);
        self
    }

    /// Parse a wire message. Worker ids are validated on the way in.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }

    /// Schema checks applied before a message is accepted into a mailbox.
    pub fn validate(&self, max_body_bytes: usize) -> Result<(), String> {
        if self.message_id.as_uuid().is_nil() {
            return Err("message_id must not be nil".to_string());
        }
        if self.subject.trim().is_empty() {
            return Err(format!("message {} has an empty subject", self.message_id));
        }
        if self.body.len() > max_body_bytes {
            return Err(format!(
                "message {} body is {} bytes (limit {max_body_bytes})",
                self.message_id,
                self.body.len()
            ));
        }
        if self.response_to == Some(self.message_id) {
            return Err(format!("message {} responds to itself", self.message_id));
        }
        Ok(())
    }
}
