// src/codec.rs
// Value codecs identified by the serializer ids carried in the tree root

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BonsaiError, Result};

/// Serializer id of the composite key layout (see `key::BonsaiKey::to_bytes`)
pub const COMPOSITE_KEY_CODEC_ID: u8 = 1;

/// Serializer id of [`BincodeCodec`]
pub const BINCODE_VALUE_CODEC_ID: u8 = 2;

/// Encodes tree values to the byte payloads stored in leaf entries.
pub trait ValueCodec<V>: Send + Sync {
    /// Codec id persisted in the root bucket; checked on load
    fn id(&self) -> u8;

    fn encode(&self, value: &V) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<V>;
}

/// Default codec for any serde value
pub struct BincodeCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> BincodeCodec<V> {
    pub fn new() -> Self {
        BincodeCodec {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for BincodeCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ValueCodec<V> for BincodeCodec<V>
where
    V: Serialize + DeserializeOwned,
{
    fn id(&self) -> u8 {
        BINCODE_VALUE_CODEC_ID
    }

    fn encode(&self, value: &V) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| BonsaiError::Serialization(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<V> {
        bincode::deserialize(data).map_err(|e| BonsaiError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bincode_codec_roundtrip() {
        let codec: BincodeCodec<String> = BincodeCodec::new();

        let encoded = codec.encode(&"hello".to_string()).unwrap();
        let decoded = codec.decode(&encoded).unwrap();

        assert_eq!(decoded, "hello");
        assert_eq!(codec.id(), BINCODE_VALUE_CODEC_ID);
    }

    #[test]
    fn test_bincode_codec_rejects_garbage() {
        let codec: BincodeCodec<String> = BincodeCodec::new();
        assert!(codec.decode(&[0xFF, 0xFF]).is_err());
    }
}
