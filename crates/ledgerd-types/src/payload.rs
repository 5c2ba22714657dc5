//! Schema-versioned event payloads.
//!
//! The ledger never interprets payload contents. A [`Payload`] is an
//! ordered map of JSON values plus a schema version, so consumers can
//! validate the fields they expect per event type while the ledger stores
//! and returns the map verbatim.
//!
//! On the wire a payload is `{"v": <version>, "data": {...}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::ValidationError;

/// Schema version assigned to payloads that do not set one explicitly.
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

const fn default_version() -> u32 {
    PAYLOAD_SCHEMA_VERSION
}

/// An opaque, schema-versioned key/value map attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Payload {
    /// Schema version of `data`, owned by the emitting component.
    #[serde(rename = "v", default = "default_version")]
    version: u32,
    /// The payload fields, sorted by key.
    #[serde(default)]
    data: BTreeMap<String, Value>,
}

impl Payload {
    /// Create an empty payload at the default schema version.
    pub const fn new() -> Self {
        Self {
            version: PAYLOAD_SCHEMA_VERSION,
            data: BTreeMap::new(),
        }
    }

    /// Set the schema version.
    #[must_use]
    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Add a field, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Insert a field, returning the previous value for that key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.data.insert(key.into(), value.into())
    }

    /// Return the schema version.
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Look up a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Look up an unsigned integer field.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    /// Return the number of fields.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Return whether the payload has no fields.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow all fields.
    pub const fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    /// Canonical JSON encoding used for hashing.
    ///
    /// Keys are emitted in sorted order at every nesting level, so two
    /// payloads with equal contents always produce equal bytes.
    pub fn canonical_json(&self) -> String {
        // BTreeMap keys and serde_json's default (sorted) object map make
        // the encoding deterministic. Serialization of a map of Values
        // cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl From<BTreeMap<String, Value>> for Payload {
    fn from(data: BTreeMap<String, Value>) -> Self {
        Self {
            version: PAYLOAD_SCHEMA_VERSION,
            data,
        }
    }
}

impl FromIterator<(String, Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<BTreeMap<_, _>>())
    }
}

impl TryFrom<Value> for Payload {
    type Error = ValidationError;

    /// Build a payload from a JSON object. `null` yields an empty payload.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            Value::Null => Ok(Self::new()),
            _ => Err(ValidationError::PayloadNotObject),
        }
    }
}
