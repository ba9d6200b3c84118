//! Task decoding
//!
//! Raw queue payloads are JSON objects. Anything else is a [`DecodeError`],
//! which the listener logs and discards without stopping.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors produced while decoding a raw payload
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Payload is not valid JSON
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Payload is valid JSON but not an object
    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// A decoded unit of work
///
/// Tasks have no identity beyond their contents; two equal payloads produce
/// two independent tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task {
    fields: Map<String, Value>,
}

impl Task {
    /// Decode a raw queue payload
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice::<Value>(raw)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(DecodeError::NotAnObject(json_kind(&other))),
        }
    }

    /// Encode this task as a queue payload
    pub fn to_payload(&self) -> Vec<u8> {
        // A map of JSON values always serializes
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }

    /// Look up a single field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All fields of the task
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume the task, returning its fields
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// Deserialize the task into a typed value
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

impl From<Map<String, Value>> for Task {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
