//! MessagePack payload helpers.
//!
//! Payload blobs are self-describing MessagePack: integers, floats,
//! booleans, UTF-8 strings, nil, arrays and string-keyed maps. Argument
//! blobs wrap the arguments in an outer array whose elements positionally
//! match the method's parameters.

use rmpv::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload failed to encode: {0}")]
    Encode(String),
    #[error("payload failed to decode: {0}")]
    Decode(String),
    #[error("argument payload is not an array")]
    NotAnArray,
}

/// Convert a serde-serializable value into the wire value model.
pub fn to_value<T: Serialize>(value: T) -> Result<Value, PayloadError> {
    rmpv::ext::to_value(value).map_err(|e| PayloadError::Encode(e.to_string()))
}

/// Convert a wire value into the caller's declared type.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, PayloadError> {
    rmpv::ext::from_value(value).map_err(|e| PayloadError::Decode(e.to_string()))
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>, PayloadError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).map_err(|e| PayloadError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value, PayloadError> {
    let mut cursor = bytes;
    rmpv::decode::read_value(&mut cursor).map_err(|e| PayloadError::Decode(e.to_string()))
}

/// Encode the positional argument array for a Call frame.
pub fn encode_args(args: &[Value]) -> Result<Vec<u8>, PayloadError> {
    encode_value(&Value::Array(args.to_vec()))
}

/// Decode a Call frame's argument blob back into the positional array.
pub fn decode_args(bytes: &[u8]) -> Result<Vec<Value>, PayloadError> {
    match decode_value(bytes)? {
        Value::Array(items) => Ok(items),
        _ => Err(PayloadError::NotAnArray),
    }
}
