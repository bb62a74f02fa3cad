//! Core data model.
//!
//! An event says that the object identified by `key` was added, updated or
//! deleted upstream. The queue holds at most one pending event per key.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Add,
    Update,
    Delete,
}

impl Action {
    /// Does this action expect the object to be present in the cache?
    pub fn expects_object(self) -> bool {
        !matches!(self, Action::Delete)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(Action::Add),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            _ => Err(format!("unknown action: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A change notification for one object.
///
/// `key` identifies the object for its whole lifetime upstream and is the
/// dedup identity inside the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub key: String,
    pub action: Action,
}

impl Event {
    pub fn new(key: impl Into<String>, action: Action) -> Self {
        Self {
            key: key.into(),
            action,
        }
    }

    pub fn add(key: impl Into<String>) -> Self {
        Self::new(key, Action::Add)
    }

    pub fn update(key: impl Into<String>) -> Self {
        Self::new(key, Action::Update)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(key, Action::Delete)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.action, self.key)
    }
}
