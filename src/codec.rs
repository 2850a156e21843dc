//! Payload encodings for outbox content.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bitcode codec: {0}")]
    Bitcode(#[from] bitcode::Error),
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),
}

/// How an event payload is serialized.
///
/// The content type travels with the message (outbox column, envelope header)
/// so the receiving side can pick the matching decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    #[default]
    Json,
    /// Compact binary encoding; both sides must share the Rust type.
    Bitcode,
}

impl Codec {
    pub const JSON_CONTENT_TYPE: &'static str = "application/json";
    pub const BITCODE_CONTENT_TYPE: &'static str = "application/x-bitcode";

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json => Self::JSON_CONTENT_TYPE,
            Codec::Bitcode => Self::BITCODE_CONTENT_TYPE,
        }
    }

    pub fn from_content_type(content_type: &str) -> Result<Self, CodecError> {
        match content_type {
            Self::JSON_CONTENT_TYPE => Ok(Codec::Json),
            Self::BITCODE_CONTENT_TYPE => Ok(Codec::Bitcode),
            other => Err(CodecError::UnsupportedContentType(other.to_string())),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::Bitcode => Ok(bitcode::serialize(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Bitcode => Ok(bitcode::deserialize(bytes)?),
        }
    }
}
