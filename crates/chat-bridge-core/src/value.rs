//! Binary-safe values for credential storage.
//!
//! Session material mixes structured data with raw key bytes, while the
//! backing stores only speak JSON-like documents. Bytes therefore travel as a
//! tagged object:
//!
//! ```json
//! { "type": "Buffer", "data": "<base64>" }
//! ```
//!
//! Decoding is lenient: the array form `{"type": "Buffer", "data": [1, 2]}`
//! and the `{"buffer": true, "value": ...}` form are accepted as well, and a
//! malformed tag is kept as a plain map instead of failing the whole read.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Maximum container nesting accepted by the encoder.
///
/// Kept below `serde_json`'s recursion limit so that anything we write can
/// be read back.
pub const MAX_DEPTH: usize = 100;

/// Marker written in place of subtrees dropped by [`StoredValue::sanitized`].
pub const CIRCULAR_SENTINEL: &str = "[Circular]";

const BUFFER_TAG: &str = "Buffer";

/// A structured value that may carry raw bytes at any depth.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<StoredValue>),
    Map(BTreeMap<String, StoredValue>),
}

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Nesting exceeded [`MAX_DEPTH`]. A self-referential source graph ends
    /// up here once it is flattened into an owned tree.
    #[error("value nests deeper than {limit} levels (cyclic reference)")]
    Cyclic { limit: usize },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a buffer, found {0}")]
    NotABuffer(&'static str),
}

impl CodecError {
    /// Whether the error stems from a cyclic (unbounded) structure.
    #[must_use]
    pub const fn is_cyclic(&self) -> bool {
        matches!(self, Self::Cyclic { .. })
    }
}

impl StoredValue {
    /// Build a map value from key/value pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Self)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a bytes value.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(data.into())
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a field of a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Encode into the tagged JSON form used by every backend.
    ///
    /// # Errors
    /// Returns [`CodecError::Cyclic`] if containers nest beyond [`MAX_DEPTH`].
    pub fn to_json(&self) -> Result<Value, CodecError> {
        encode(self, 0)
    }

    /// Decode from the tagged JSON form. Never fails.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        decode(value)
    }

    /// Convert any serializable type, turning tagged buffers into bytes.
    ///
    /// # Errors
    /// Returns error if `value` cannot be represented as JSON.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        Ok(Self::from_json(serde_json::to_value(value)?))
    }

    /// Deserialize into a concrete type.
    ///
    /// # Errors
    /// Returns error if the value is too deep or does not match `T`.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }

    /// Copy of this value with every container at the depth bound replaced
    /// by [`CIRCULAR_SENTINEL`]. The result always encodes.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        sanitize(self, 0)
    }
}

fn encode(value: &StoredValue, depth: usize) -> Result<Value, CodecError> {
    let nested = matches!(value, StoredValue::List(_) | StoredValue::Map(_));
    if nested && depth >= MAX_DEPTH {
        return Err(CodecError::Cyclic { limit: MAX_DEPTH });
    }

    Ok(match value {
        StoredValue::Null => Value::Null,
        StoredValue::Bool(b) => Value::Bool(*b),
        StoredValue::Number(n) => Value::Number(n.clone()),
        StoredValue::String(s) => Value::String(s.clone()),
        StoredValue::Bytes(b) => buffer_json(b),
        StoredValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| encode(item, depth + 1))
                .collect::<Result<Vec<_>, CodecError>>()?,
        ),
        StoredValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), encode(v, depth + 1)?)))
                .collect::<Result<Map<_, _>, CodecError>>()?,
        ),
    })
}

fn sanitize(value: &StoredValue, depth: usize) -> StoredValue {
    match value {
        StoredValue::List(_) | StoredValue::Map(_) if depth >= MAX_DEPTH => {
            StoredValue::String(CIRCULAR_SENTINEL.to_string())
        }
        StoredValue::List(items) => {
            StoredValue::List(items.iter().map(|v| sanitize(v, depth + 1)).collect())
        }
        StoredValue::Map(entries) => StoredValue::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), sanitize(v, depth + 1)))
                .collect(),
        ),
        leaf => leaf.clone(),
    }
}

fn buffer_json(bytes: &[u8]) -> Value {
    let mut obj = Map::with_capacity(2);
    obj.insert("type".to_string(), Value::String(BUFFER_TAG.to_string()));
    obj.insert("data".to_string(), Value::String(BASE64.encode(bytes)));
    Value::Object(obj)
}

fn decode(value: Value) -> StoredValue {
    match value {
        Value::Null => StoredValue::Null,
        Value::Bool(b) => StoredValue::Bool(b),
        Value::Number(n) => StoredValue::Number(n),
        Value::String(s) => StoredValue::String(s),
        Value::Array(items) => StoredValue::List(items.into_iter().map(decode).collect()),
        Value::Object(obj) => match buffer_payload(&obj) {
            Some(bytes) => StoredValue::Bytes(bytes),
            None => StoredValue::Map(obj.into_iter().map(|(k, v)| (k, decode(v))).collect()),
        },
    }
}

/// Extract the bytes of a tagged buffer object, if `obj` is one that can be
/// decoded.
fn buffer_payload(obj: &Map<String, Value>) -> Option<Vec<u8>> {
    let tagged = obj.get("type").and_then(Value::as_str) == Some(BUFFER_TAG)
        || obj.get("buffer") == Some(&Value::Bool(true));
    if !tagged {
        return None;
    }

    let payload = obj
        .get("data")
        .filter(|v| !v.is_null())
        .or_else(|| obj.get("value"));

    match payload {
        None | Some(Value::Null) => Some(Vec::new()),
        Some(Value::String(s)) => match BASE64.decode(s) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!(error = %e, "tagged buffer holds invalid base64, keeping it as a map");
                None
            }
        },
        // Out-of-range entries wrap and non-numbers become zero.
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|v| match v {
                    Value::Number(n) => n
                        .as_u64()
                        .or_else(|| n.as_i64().map(|i| i as u64))
                        .or_else(|| n.as_f64().map(|f| f as i64 as u64))
                        .map_or(0, |n| (n & 0xff) as u8),
                    _ => 0,
                })
                .collect(),
        ),
        Some(_) => None,
    }
}

impl Serialize for StoredValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StoredValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_json)
    }
}

impl From<Vec<u8>> for StoredValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&str> for StoredValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for StoredValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for StoredValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<u64> for StoredValue {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

/// Serde adapter for `Vec<u8>` fields stored as tagged buffers.
///
/// Use with `#[serde(with = "chat_bridge_core::value::buffer")]`.
pub mod buffer {
    use base64::Engine as _;

    use super::{BASE64, CodecError, Deserialize, Deserializer, Serialize, Serializer, StoredValue, Value};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        super::buffer_json(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        from_value(Value::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }

    pub(super) fn from_value(value: Value) -> Result<Vec<u8>, CodecError> {
        match StoredValue::from_json(value) {
            StoredValue::Bytes(b) => Ok(b),
            // Bare base64 strings are what older writers produced.
            StoredValue::String(s) => BASE64
                .decode(s)
                .map_err(|_| CodecError::NotABuffer("a non-base64 string")),
            StoredValue::Null => Err(CodecError::NotABuffer("null")),
            StoredValue::Bool(_) => Err(CodecError::NotABuffer("a boolean")),
            StoredValue::Number(_) => Err(CodecError::NotABuffer("a number")),
            StoredValue::List(_) => Err(CodecError::NotABuffer("a list")),
            StoredValue::Map(_) => Err(CodecError::NotABuffer("a map")),
        }
    }

    /// Optional variant: `null` or a missing field maps to `None`.
    pub mod option {
        use super::{Deserialize, Deserializer, Serializer, Value};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => super::serialize(b, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            match Option::<Value>::deserialize(deserializer)? {
                None | Some(Value::Null) => Ok(None),
                Some(v) => super::from_value(v)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}
