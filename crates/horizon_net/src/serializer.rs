//! Pluggable payload serialization.
//!
//! The framework never looks inside payloads; it only needs to turn handler
//! arguments into bytes and back. [`Serializer`] is object safe so a server can
//! hold any implementation behind an `Arc<dyn Serializer>`: typed values travel
//! through `serde_json::Value`, which every self-describing format can map to.
//!
//! Schema-bound codecs such as protobuf encode their own bytes and use the raw
//! APIs instead: [`Service::handle_raw`](crate::component::Service::handle_raw),
//! [`Session::push_raw`](crate::session::Session::push_raw),
//! [`Session::response_raw`](crate::session::Session::response_raw) and
//! [`Group::broadcast_raw`](crate::group::Group::broadcast_raw).

use crate::error::NetError;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Converts payload values to bytes and back.
pub trait Serializer: Send + Sync + 'static {
    /// Encodes a value into wire bytes.
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, NetError>;

    /// Decodes wire bytes into a value.
    fn unmarshal(&self, data: &[u8]) -> Result<Value, NetError>;

    /// Human-readable name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Serializes any `T: Serialize` through the given serializer.
pub fn serialize<T>(serializer: &dyn Serializer, value: &T) -> Result<Bytes, NetError>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(value)?;
    Ok(Bytes::from(serializer.marshal(&value)?))
}

/// Deserializes bytes into any `T: DeserializeOwned` through the given serializer.
pub fn deserialize<T>(serializer: &dyn Serializer, data: &[u8]) -> Result<T, NetError>
where
    T: DeserializeOwned,
{
    let value = serializer.unmarshal(data)?;
    Ok(serde_json::from_value(value)?)
}

/// JSON serializer, the default for new servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for JsonSerializer {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, NetError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, NetError> {
        Ok(serde_json::from_slice(data)?)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct UserMessage {
        name: String,
        content: String,
    }

    #[test]
    fn test_json_typed_values() {
        let serializer = JsonSerializer::new();
        let msg = UserMessage {
            name: "alice".into(),
            content: "hello".into(),
        };

        let bytes = serialize(&serializer, &msg).unwrap();
        let back: UserMessage = deserialize(&serializer, &bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_json_rejects_mismatched_shape() {
        let serializer = JsonSerializer::new();
        let result: Result<UserMessage, _> = deserialize(&serializer, br#"{"name": 3}"#);
        assert!(matches!(result, Err(NetError::Serialization(_))));

        let garbage: Result<UserMessage, _> = deserialize(&serializer, b"not json");
        assert!(garbage.is_err());
    }
}
