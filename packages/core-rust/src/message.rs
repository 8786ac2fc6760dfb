//! Broker message envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Header carrying the codec name used to encode `body`.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
/// Header carrying the id of the publishing node, when known.
pub const PUBLISHER_HEADER: &str = "Micro-Publisher";

/// A broker message: string headers plus an opaque, codec-dependent body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub header: HashMap<String, String>,
    #[serde(with = "serde_bytes", default)]
    pub body: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Sets a header, returning `self` for chaining.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header.get(CONTENT_TYPE_HEADER).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_header_sets_content_type() {
        let msg = Message::new(b"hi".to_vec()).with_header(CONTENT_TYPE_HEADER, "json");
        assert_eq!(msg.content_type(), Some("json"));
        assert_eq!(msg.body, b"hi");
    }

    #[test]
    fn missing_content_type_is_none() {
        assert!(Message::default().content_type().is_none());
    }
}
