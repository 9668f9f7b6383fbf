//! Body serializers: application values to message bodies.
//!
//! Handlers and publishers work with `serde` types. The value is first
//! converted to a `serde_json::Value`, then a [`Serializer`] chosen by
//! content type turns it into body bytes.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{HandlerError, Message, SerializationError};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Serialization options for the default JSON serializer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerSettings {
    /// Indented output
    pub pretty: bool,
    /// Drop object fields whose value is `null`
    pub omit_null_fields: bool,
}

/// Body serializer for one content type.
pub trait Serializer: Send + Sync {
    fn content_type(&self) -> &str;

    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError>;
}

#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    settings: SerializerSettings,
}

impl JsonSerializer {
    pub fn new(settings: SerializerSettings) -> Self {
        Self { settings }
    }

    fn error(e: serde_json::Error) -> SerializationError {
        SerializationError {
            content_type: JSON_CONTENT_TYPE.into(),
            reason: e.to_string(),
        }
    }
}

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError> {
        let stripped;
        let value = if self.settings.omit_null_fields {
            stripped = strip_nulls(value.clone());
            &stripped
        } else {
            value
        };

        let bytes = if self.settings.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
        .map_err(Self::error)?;
        Ok(Bytes::from(bytes))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes).map_err(Self::error)
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Serializers available to one publisher or subscriber.
///
/// Outgoing bodies use the most recently registered custom serializer, or
/// JSON when none was registered. Incoming bodies are decoded by the
/// serializer matching their `ContentType` header, falling back to JSON.
#[derive(Clone)]
pub struct SerializerRegistry {
    outgoing: Arc<dyn Serializer>,
    json: Arc<dyn Serializer>,
    by_content_type: HashMap<String, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    pub fn new(settings: SerializerSettings, custom: &[Arc<dyn Serializer>]) -> Self {
        let json: Arc<dyn Serializer> = Arc::new(JsonSerializer::new(settings));
        let mut by_content_type = HashMap::new();
        by_content_type.insert(JSON_CONTENT_TYPE.to_string(), Arc::clone(&json));
        for serializer in custom {
            by_content_type.insert(serializer.content_type().to_string(), Arc::clone(serializer));
        }
        let outgoing = custom.last().cloned().unwrap_or_else(|| Arc::clone(&json));

        Self {
            outgoing,
            json,
            by_content_type,
        }
    }

    /// Content type stamped on outgoing messages.
    pub fn content_type(&self) -> &str {
        self.outgoing.content_type()
    }

    pub fn encode_value(&self, value: &Value) -> Result<Bytes, SerializationError> {
        self.outgoing.serialize(value)
    }

    pub fn to_body<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, SerializationError> {
        let value = serde_json::to_value(value).map_err(|e| SerializationError {
            content_type: self.content_type().to_string(),
            reason: e.to_string(),
        })?;
        self.encode_value(&value)
    }

    pub fn decode_value(&self, message: &Message) -> Result<Value, SerializationError> {
        let serializer = message
            .content_type()
            .and_then(|ct| self.by_content_type.get(ct))
            .unwrap_or(&self.json);
        serializer.deserialize(message.body())
    }

    /// Decode a message body into a handler argument.
    pub fn from_body<T: DeserializeOwned>(&self, message: &Message) -> Result<T, HandlerError> {
        let value = self
            .decode_value(message)
            .map_err(|e| HandlerError::Deserialization(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| HandlerError::Deserialization(e.to_string()))
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new(SerializerSettings::default(), &[])
    }
}
