//! Marshal/unmarshal boundary.
//!
//! The framework only ever needs `marshal(value) -> bytes` and
//! `unmarshal(bytes) -> value`. The concrete encoding is chosen by the caller
//! through [`Codec`]; `MsgPack` uses `rmp_serde::to_vec_named()` so field names
//! survive the round-trip.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors produced while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("unknown codec: {0}")]
    Unknown(String),
}

/// Wire encoding used for message bodies and request payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Codec {
    #[default]
    Json,
    MsgPack,
}

impl Codec {
    /// Name placed in `Content-Type` headers.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Codec::Json => "application/json",
            Codec::MsgPack => "application/msgpack",
        }
    }

    /// Encodes `value`.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if `value` cannot be represented in this encoding.
    pub fn marshal<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    /// Decodes `data` into `T`.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if `data` is malformed or does not match `T`.
    pub fn unmarshal<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(data)?),
            Codec::MsgPack => Ok(rmp_serde::from_slice(data)?),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" | "application/json" => Ok(Codec::Json),
            "msgpack" | "application/msgpack" | "application/x-msgpack" => Ok(Codec::MsgPack),
            other => Err(CodecError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::message::Message;

    #[test]
    fn json_and_msgpack_decode_what_they_encode() {
        let mut header = HashMap::new();
        header.insert("k".to_string(), "v".to_string());
        let msg = Message {
            header,
            body: vec![0, 1, 2, 255],
        };

        for codec in [Codec::Json, Codec::MsgPack] {
            let bytes = codec.marshal(&msg).unwrap();
            let back: Message = codec.unmarshal(&bytes).unwrap();
            assert_eq!(back, msg, "codec {codec}");
        }
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(Codec::Json.unmarshal::<Message>(b"{not json").is_err());
        assert!(Codec::MsgPack.unmarshal::<Message>(&[0xc1]).is_err());
    }

    #[test]
    fn parses_short_and_mime_names() {
        assert_eq!("json".parse::<Codec>().unwrap(), Codec::Json);
        assert_eq!("application/msgpack".parse::<Codec>().unwrap(), Codec::MsgPack);
        assert!(matches!("xml".parse::<Codec>(), Err(CodecError::Unknown(_))));
    }
}
