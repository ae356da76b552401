use crate::corruption;
use crate::error::Result;
use crate::types::{Key, Value};

/// A key-value pair together with its recomputable key hash.
///
/// On disk an entry is `encode(key) ++ encode(value)`, back to back with no
/// separators or padding. The hash is not stored.
#[derive(Debug, Clone)]
pub struct Entry<K, V> {
    pub key: K,
    pub hash: u64,
    pub value: V,
}

impl<K: Key, V: Value> Entry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        let hash = key.hash();
        Self { key, hash, value }
    }

    /// On-disk size of one entry.
    pub fn disk_size() -> usize {
        K::ENCODED_SIZE + V::ENCODED_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.key.encode();
        buf.extend_from_slice(&self.value.encode());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::disk_size() {
            return Err(corruption!(
                "entry has {} bytes, expected {}",
                bytes.len(),
                Self::disk_size()
            ));
        }
        let key = K::decode(&bytes[..K::ENCODED_SIZE])?;
        let value = V::decode(&bytes[K::ENCODED_SIZE..])?;
        Ok(Self::new(key, value))
    }
}
