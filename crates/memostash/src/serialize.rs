use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Converts values to and from bytes.
///
/// Implementations must be deterministic: serializing equal values must
/// produce equal bytes across repeated calls, process restarts and
/// platforms, since the bytes feed the cache key derivation. They must
/// also be type-distinguishing in combination with the key builder, which
/// additionally folds the concrete argument type into the key.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// The default serializer: compact, deterministic binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bincode;

impl Serializer for Bincode {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::Serializer(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| Error::Serializer(e.to_string()))
    }
}

/// JSON-backed serializer.
///
/// Larger and slower than [`Bincode`], but the entries on disk stay
/// human-readable, which helps when inspecting a cache tree by hand.
/// Unordered map types have no deterministic JSON encoding; prefer ordered
/// maps (`BTreeMap`) in argument types when using this serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Serializer for Json {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serializer(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serializer(e.to_string()))
    }
}
