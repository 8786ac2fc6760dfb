//! Dynamic configuration change events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What happened to a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Add,
    Delete,
    Update,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Add => "add",
            EventType::Delete => "delete",
            EventType::Update => "update",
        };
        f.write_str(s)
    }
}

/// A remote configuration change delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub key: String,
    /// Full new content for `Add`/`Update`; empty for `Delete`.
    pub value: String,
    pub config_type: EventType,
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeEvent{{key = {}, value = {}, type = {}}}", self.key, self.value, self.config_type)
    }
}
