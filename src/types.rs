use std::fmt::Display;

use crc::{Algorithm, Crc};

use crate::error::{Error, Result};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA);

/// A fixed-size, hashable key.
///
/// Every `encode` result must be exactly `ENCODED_SIZE` bytes, and `hash`
/// must be deterministic with domain `[0, 2^HASH_BITS)`. The hash is never
/// stored on disk; it is recomputed from the decoded key.
pub trait Key: Clone + PartialEq + Display + Send + 'static {
    /// Encoded byte length.
    const ENCODED_SIZE: usize;

    /// Number of meaningful hash bits.
    const HASH_BITS: u32;

    fn hash(&self) -> u64;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// A fixed-size value.
pub trait Value: Clone + Send + 'static {
    /// Encoded byte length.
    const ENCODED_SIZE: usize;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// A raw byte-string key of length `N`, hashed with CRC-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteKey<const N: usize>(pub [u8; N]);

impl<const N: usize> ByteKey<N> {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes)
    }
}

impl<const N: usize> Display for ByteKey<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl<const N: usize> Key for ByteKey<N> {
    const ENCODED_SIZE: usize = N;
    const HASH_BITS: u32 = 64;

    fn hash(&self) -> u64 {
        CRC64.checksum(&self.0)
    }

    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != N {
            return Err(Error::InvalidKeySize {
                expected: N,
                found: bytes.len(),
            });
        }
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

/// A raw byte-string value of length `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteValue<const N: usize>(pub [u8; N]);

impl<const N: usize> ByteValue<N> {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes)
    }
}

impl<const N: usize> Value for ByteValue<N> {
    const ENCODED_SIZE: usize = N;

    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != N {
            return Err(Error::InvalidValueSize {
                expected: N,
                found: bytes.len(),
            });
        }
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}
