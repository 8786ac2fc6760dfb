//! Typed RPC request/response envelopes.
//!
//! Request-scoped data (auth tokens, caller identity, trace ids) travels in
//! the explicit `metadata` map of each envelope rather than in an ambient
//! context.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{Codec, CodecError};
use crate::constants::AUTHORIZATION_KEY;

const BEARER: &str = "bearer";

/// String key/value pairs attached to a request or response.
pub type Metadata = HashMap<String, String>;

/// A unary RPC request addressed to `service` / `endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Registry name of the target service.
    pub service: String,
    /// `Handler.Method`.
    pub endpoint: String,
    pub codec: Codec,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Request {
    /// Builds a request by encoding `payload` with `codec`.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the payload cannot be encoded.
    pub fn encode<T: Serialize + ?Sized>(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        codec: Codec,
        payload: &T,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            service: service.into(),
            endpoint: endpoint.into(),
            codec,
            body: codec.marshal(payload)?,
            metadata: Metadata::new(),
        })
    }

    /// Decodes the body with the request's codec.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the body does not decode into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.codec.unmarshal(&self.body)
    }

    /// Splits `endpoint` into `(handler, method)`.
    #[must_use]
    pub fn handler_method(&self) -> Option<(&str, &str)> {
        self.endpoint.split_once('.')
    }

    /// Bearer token from the `authorization` metadata entry, if well-formed.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        self.metadata
            .get(AUTHORIZATION_KEY)
            .and_then(|v| extract_token_from_auth_header(v))
    }

    /// Stores `token` as a bearer `authorization` entry.
    pub fn set_bearer_token(&mut self, token: &str) {
        self.metadata
            .insert(AUTHORIZATION_KEY.to_string(), generate_auth_header(token));
    }
}

/// Response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub codec: Codec,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Response {
    /// Builds a response by encoding `payload` with `codec`.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the payload cannot be encoded.
    pub fn encode<T: Serialize + ?Sized>(codec: Codec, payload: &T) -> Result<Self, CodecError> {
        Ok(Self {
            codec,
            body: codec.marshal(payload)?,
            metadata: Metadata::new(),
        })
    }

    /// Decodes the body with the response's codec.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the body does not decode into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.codec.unmarshal(&self.body)
    }
}

/// Formats `token` as an `Authorization` header value.
#[must_use]
pub fn generate_auth_header(token: &str) -> String {
    format!("Bearer {token}")
}

/// Extracts the token from a `Bearer <token>` header value (scheme is case-insensitive).
#[must_use]
pub fn extract_token_from_auth_header(value: &str) -> Option<&str> {
    let mut parts = value.split(' ');
    let (scheme, token) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case(BEARER) || token.is_empty() {
        return None;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_and_decodes_payload() {
        let req = Request::encode("greeter", "Greeter.Hello", Codec::MsgPack, &("bob", 3u8)).unwrap();
        let (name, n): (String, u8) = req.decode().unwrap();
        assert_eq!(name, "bob");
        assert_eq!(n, 3);
        assert_eq!(req.handler_method(), Some(("Greeter", "Hello")));
    }

    #[test]
    fn endpoint_without_method_has_no_handler_split() {
        let req = Request::encode("s", "Ping", Codec::Json, &()).unwrap();
        assert!(req.handler_method().is_none());
    }

    #[test]
    fn bearer_token_roundtrips_through_metadata() {
        let mut req = Request::encode("s", "A.b", Codec::Json, &()).unwrap();
        assert!(req.bearer_token().is_none());
        req.set_bearer_token("abc.def");
        assert_eq!(req.metadata[AUTHORIZATION_KEY], "Bearer abc.def");
        assert_eq!(req.bearer_token(), Some("abc.def"));
    }

    #[test]
    fn auth_header_parsing_is_strict() {
        assert_eq!(extract_token_from_auth_header("bearer t"), Some("t"));
        assert_eq!(extract_token_from_auth_header("BEARER t"), Some("t"));
        assert!(extract_token_from_auth_header("Basic t").is_none());
        assert!(extract_token_from_auth_header("Bearer").is_none());
        assert!(extract_token_from_auth_header("Bearer a b").is_none());
    }
}
