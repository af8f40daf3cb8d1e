//! Message serialization.
//!
//! RPC message types implement both `prost::Message` (binary protobuf) and
//! serde (JSON), so a single client can speak either encoding based on
//! configuration. [`Encoding`] is the runtime switch between the two.

use bytes::Bytes;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{Code, ConnectError};

/// Bounds required of every RPC message type.
///
/// Blanket-implemented; generated message types satisfy it automatically.
pub trait RpcMessage:
    Message + Serialize + DeserializeOwned + Default + Send + 'static
{
}

impl<T> RpcMessage for T where
    T: Message + Serialize + DeserializeOwned + Default + Send + 'static
{
}

/// Message encoding negotiated for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Binary protobuf.
    Proto,
    /// JSON.
    Json,
}

impl Encoding {
    /// Codec name as it appears in content types and query parameters.
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Proto => "proto",
            Encoding::Json => "json",
        }
    }

    /// Serialize a message.
    pub fn serialize<M: RpcMessage>(&self, message: &M) -> Result<Bytes, MessageCodecError> {
        match self {
            Encoding::Proto => Ok(Bytes::from(message.encode_to_vec())),
            Encoding::Json => serde_json::to_vec(message)
                .map(Bytes::from)
                .map_err(MessageCodecError::Encode),
        }
    }

    /// Serialize with stable output for a given message value.
    ///
    /// Used for GET request URLs, where the bytes participate in cache keys.
    pub fn deterministically_serialize<M: RpcMessage>(
        &self,
        message: &M,
    ) -> Result<Bytes, MessageCodecError> {
        // prost encodes fields in tag order and serde_json in declaration
        // order, so the default serialization is already stable.
        self.serialize(message)
    }

    /// Deserialize a message.
    pub fn deserialize<M: RpcMessage>(&self, data: &[u8]) -> Result<M, MessageCodecError> {
        match self {
            Encoding::Proto => M::decode(data).map_err(MessageCodecError::DecodeProto),
            Encoding::Json => serde_json::from_slice(data).map_err(MessageCodecError::DecodeJson),
        }
    }
}

/// Serialization failures.
///
/// These are local failures, surfaced to callers as `unknown` with the
/// underlying error attached.
#[derive(Debug, Error)]
pub enum MessageCodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    DecodeProto(#[source] prost::DecodeError),

    #[error("failed to decode message: {0}")]
    DecodeJson(#[source] serde_json::Error),
}

impl From<MessageCodecError> for ConnectError {
    fn from(err: MessageCodecError) -> Self {
        ConnectError::wrapping(Code::Unknown, err.to_string(), err)
    }
}
