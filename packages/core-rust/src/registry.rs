//! Service discovery data model: services, nodes, endpoints, and the
//! membership-change events a registry watcher produces.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so the JSON and
//! `MsgPack` encodings match what registry backends store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named logical application composed of one or more nodes.
///
/// Registries group nodes by `(name, version)`; `GetService` returns one
/// `Service` per version sharing the same name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    /// Creates a service with a name and version and no nodes.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Appends a node, returning `self` for chaining.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends an endpoint, returning `self` for chaining.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Addresses of all nodes, in node order.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.address.clone()).collect()
    }
}

/// One network-addressable instance of a [`Service`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique within the owning service.
    pub id: String,
    /// `host:port`.
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    /// Splits `address` into host and port.
    ///
    /// Returns `None` when the address has no `:port` suffix or the port is
    /// not a valid `u16`. IPv6 literals in brackets are supported.
    #[must_use]
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let (host, port) = self.address.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Some((host, port))
    }
}

/// An RPC method descriptor published alongside a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// `Handler.Method`.
    pub name: String,
    #[serde(default)]
    pub request: Option<Value>,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Minimal recursive schema tree describing a request or response shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Value {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Value {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            values: Vec::new(),
        }
    }

    /// Adds a nested field, returning `self` for chaining.
    #[must_use]
    pub fn with_field(mut self, field: Value) -> Self {
        self.values.push(field);
        self
    }
}

/// Kind of membership change carried by a [`RegistryEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

/// A single membership change produced by a registry watcher.
///
/// `service` carries only the nodes affected by the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEvent {
    /// Backend-assigned event id, unique per watcher.
    pub id: String,
    pub action: EventAction,
    pub service: Service,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}
