//! Flavors, opaque values, and record addressing.
//!
//! Defines [`CacheFlavor`], the two record families the runtime supports,
//! [`Value`], the opaque unit stored in engines, and [`RecordDescriptor`],
//! the `(flavor, scope, key)` tuple every engine operation is addressed by.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Engine name reserved for the built-in in-memory engine.
pub const MEMORY_ENGINE: &str = "memory";

/// Scope used when the caller does not name one.
pub const DEFAULT_SCOPE: &str = "global";

/// The record family, determining storage semantics.
///
/// `database` is a planned third flavor; it has no variant here and every
/// textual entry point rejects it explicitly (see [`CacheFlavor::parse`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheFlavor {
    /// Generic key/value records.
    Kvs,
    /// File-backed records mirroring an on-disk file.
    Files,
}

impl CacheFlavor {
    /// Wire name of the flavor (`"kvs"` / `"files"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kvs => "kvs",
            Self::Files => "files",
        }
    }

    /// Parses a wire name into a flavor.
    ///
    /// `"database"` is rejected with a dedicated error until that flavor
    /// exists, so callers can distinguish "reserved" from "unknown".
    pub fn parse(name: &str) -> Result<Self, FlavorError> {
        match name {
            "kvs" => Ok(Self::Kvs),
            "files" => Ok(Self::Files),
            "database" => Err(FlavorError::Reserved),
            other => Err(FlavorError::Unknown {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for CacheFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from parsing a flavor name.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlavorError {
    #[error("flavor \"database\" is reserved and not yet supported")]
    Reserved,
    #[error("unknown flavor: {name}")]
    Unknown { name: String },
}

/// Opaque value stored in engines.
///
/// KV records may carry either variant; file records always carry `Bytes`
/// (the cached file content). The JSON wire form is adjacently tagged:
/// `{"kind": "bytes", "data": "<base64>"}` or `{"kind": "json", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Value {
    /// Raw bytes, base64-encoded on the wire.
    #[serde(with = "base64_bytes")]
    Bytes(Bytes),
    /// Structured JSON data.
    Json(serde_json::Value),
}

impl Value {
    /// Convenience constructor for string data.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::Json(serde_json::Value::String(s.into()))
    }

    /// Estimated heap cost of this value in bytes.
    ///
    /// Used for `stats.size` and memory accounting; an estimate, not an
    /// exact measurement.
    #[must_use]
    pub fn estimate_size(&self) -> u64 {
        match self {
            Self::Bytes(b) => b.len() as u64,
            Self::Json(v) => estimate_json(v),
        }
    }

    /// Returns the raw bytes if this is a `Bytes` value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Json(_) => None,
        }
    }
}

/// Recursive size estimate for a JSON value.
///
/// Counts string/number payloads plus a small per-node overhead; containers
/// sum their children. Keys count like strings.
fn estimate_json(v: &serde_json::Value) -> u64 {
    const NODE_OVERHEAD: u64 = 8;
    match v {
        serde_json::Value::Null | serde_json::Value::Bool(_) => NODE_OVERHEAD,
        serde_json::Value::Number(_) => NODE_OVERHEAD + 8,
        serde_json::Value::String(s) => NODE_OVERHEAD + s.len() as u64,
        serde_json::Value::Array(items) => {
            NODE_OVERHEAD + items.iter().map(estimate_json).sum::<u64>()
        }
        serde_json::Value::Object(map) => {
            NODE_OVERHEAD
                + map
                    .iter()
                    .map(|(k, val)| k.len() as u64 + estimate_json(val))
                    .sum::<u64>()
        }
    }
}

/// Codec between [`Value`] and engine-native bytes.
///
/// Remote engines project values into their own keyspace as bytes; the codec
/// is chosen by the record's flavor. KV values round-trip through any codec;
/// file content is always raw bytes.
pub trait ValueCodec: Send + Sync {
    /// Encodes a value into engine bytes.
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError>;
    /// Decodes engine bytes back into a value.
    fn decode(&self, bytes: Bytes) -> Result<Value, CodecError>;
}

/// Errors from value encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value is not raw bytes")]
    NotBytes,
    #[error("malformed value encoding: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Codec for file content: bytes in, bytes out.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ValueCodec for RawCodec {
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        value.as_bytes().cloned().ok_or(CodecError::NotBytes)
    }

    fn decode(&self, bytes: Bytes) -> Result<Value, CodecError> {
        Ok(Value::Bytes(bytes))
    }
}

/// Codec serializing any value through its JSON wire form.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: Bytes) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// The `(flavor, scope, key)` tuple addressing a record in every engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordDescriptor {
    pub flavor: CacheFlavor,
    pub scope: String,
    pub key: String,
}

impl RecordDescriptor {
    #[must_use]
    pub fn new(flavor: CacheFlavor, scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            flavor,
            scope: scope.into(),
            key: key.into(),
        }
    }

    /// Checks the non-empty constraints on scope and key.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.scope.is_empty() {
            return Err(DescriptorError::EmptyScope);
        }
        if self.key.is_empty() {
            return Err(DescriptorError::EmptyKey);
        }
        Ok(())
    }
}

impl std::fmt::Display for RecordDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.flavor, self.scope, self.key)
    }
}

/// Violations of the descriptor constraints.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("scope must be a non-empty string")]
    EmptyScope,
    #[error("key must be a non-empty string")]
    EmptyKey,
}

mod base64_bytes {
    //! Base64 wire form for `Value::Bytes`.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
