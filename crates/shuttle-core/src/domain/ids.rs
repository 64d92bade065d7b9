//! Domain identifiers (strongly-typed IDs).
//!
//! Task and worker ids are caller-chosen strings, so `Id<T>` wraps a `String`
//! and uses a phantom marker to keep the two from being mixed up. Generated
//! task ids are `task-<ULID>`, which keeps them sortable by creation time.
//!
//! Message ids are UUIDs and live in `message.rs`.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

const MAX_ID_LEN: usize = 128;

/// Marker trait for each id family.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used for generated ids (e.g. "task-").
    fn prefix() -> &'static str;

    /// Human label used in validation errors.
    fn label() -> &'static str;
}

/// Generic string id.
///
/// Ids are restricted to `[A-Za-z0-9._:@-]`: worker ids double as mailbox
/// board names, which end up as file names. Deserialization applies the
/// same check as `parse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Validate and wrap a raw id.
    pub fn parse(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.is_empty() {
            return Err(format!("{} id must not be empty", T::label()));
        }
        if value.len() > MAX_ID_LEN {
            return Err(format!(
                "{} id exceeds {MAX_ID_LEN} characters",
                T::label()
            ));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '@' | '-')))
        {
            return Err(format!("{} id contains invalid character {bad:?}", T::label()));
        }
        Ok(Self {
            value,
            _marker: PhantomData,
        })
    }

    /// Build an id from a ULID (`<prefix><ulid>`).
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            value: format!("{}{}", T::prefix(), ulid),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(value).map_err(serde::de::Error::custom)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<T: IdMarker> AsRef<str> for Id<T> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

// ========================================
// markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }

    fn label() -> &'static str {
        "task"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }

    fn label() -> &'static str {
        "worker"
    }
}

/// Identifier of a Task (unique across every board).
pub type TaskId = Id<Task>;

/// Identifier of a worker (task owner, mailbox recipient).
pub type WorkerId = Id<Worker>;
