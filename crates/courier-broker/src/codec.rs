//! Wire codec.
//!
//! Envelopes are handled as JSON values inside the broker; the codec turns
//! them into bytes and back. `JsonCodec` is the default. `FnCodec` plugs in
//! any serializer/deserializer pair.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Serializer/deserializer pair applied to every envelope.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// JSON text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

type EncodeFn = dyn Fn(&Value) -> Result<Vec<u8>, CodecError> + Send + Sync;
type DecodeFn = dyn Fn(&[u8]) -> Result<Value, CodecError> + Send + Sync;

/// Codec built from two closures.
pub struct FnCodec {
    encode: Box<EncodeFn>,
    decode: Box<DecodeFn>,
}

impl FnCodec {
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&Value) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<Value, CodecError> + Send + Sync + 'static,
    {
        Self {
            encode: Box::new(encode),
            decode: Box::new(decode),
        }
    }
}

impl Codec for FnCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        (self.encode)(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        (self.decode)(bytes)
    }
}

impl fmt::Debug for FnCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCodec(..)")
    }
}
