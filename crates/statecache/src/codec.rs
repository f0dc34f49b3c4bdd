//! Encoding of cached values to and from the bytes kept in the state store.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors encoding or decoding a cached value.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("value cannot be serialized: {0}")]
    Serialization(String),
    #[error("stored bytes cannot be deserialized: {0}")]
    Deserialization(String),
}

/// A bidirectional byte encoding for cacheable values.
///
/// `decode(encode(v))` must yield a value equal to `v`, also when encoding and decoding happen in
/// different processes.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Compact MessagePack encoding, the default.
///
/// Structs are written as maps with their field names, so adding an optional field to a cached
/// type does not invalidate existing entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(value).map_err(|err| CodecError::Serialization(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|err| CodecError::Deserialization(err.to_string()))
    }
}

/// JSON encoding, handy when entries should be readable with other tools.
///
/// Note that JSON has no representation for raw bytes or non-finite floats.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|err| CodecError::Serialization(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Deserialization(err.to_string()))
    }
}
