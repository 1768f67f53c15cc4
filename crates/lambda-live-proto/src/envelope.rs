use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtoError;

/// Maximum number of characters carried by a single fragment.
pub const CHUNK_SIZE: usize = 50_000;

/// Serialized envelopes longer than this many bytes are offloaded to storage.
pub const STORAGE_THRESHOLD: usize = 1024 * 1024;

/// Envelope type used for storage indirection.
pub const POINTER_TYPE: &str = "pointer";

/// A typed message as it travels over the broker.
///
/// `source_id` identifies the publishing process so that a process can drop its
/// own broadcasts when they fan back out to it. Stubs that never receive their
/// own broadcasts omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sourceID", default)]
    pub source_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Envelope {
    pub fn new(
        kind: impl Into<String>,
        source_id: impl Into<String>,
        properties: Map<String, Value>,
    ) -> Self {
        Self {
            kind: kind.into(),
            source_id: source_id.into(),
            properties,
        }
    }

    pub fn pointer(source_id: impl Into<String>, pointer: &PointerProperties) -> Self {
        let properties = match serde_json::to_value(pointer) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self::new(POINTER_TYPE, source_id, properties)
    }

    pub fn is_pointer(&self) -> bool {
        self.kind == POINTER_TYPE
    }

    /// Reads the storage reference out of a pointer envelope.
    pub fn pointer_properties(&self) -> Result<PointerProperties, ProtoError> {
        Ok(serde_json::from_value(Value::Object(
            self.properties.clone(),
        ))?)
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// One chunk of a serialized [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub index: u32,
    pub count: u32,
    pub data: String,
}

impl Fragment {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Properties of a pointer envelope: where the real envelope was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerProperties {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub gzip: bool,
}
