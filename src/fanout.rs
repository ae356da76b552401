//! Coarse hash-prefix partitioning over the sorted index file.
//!
//! The fan-out maps the top bits of a key hash to the byte interval of the
//! sorted entries region that contains every entry with that hash prefix.
//! Each bucket records the byte offset of the last entry whose hash falls
//! in it; `search` returns the previous bucket's offset as the lower bound,
//! so the interval always encloses the bucket's entries. Bucket count is
//! sized so that one bucket covers roughly one disk page of entries.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::corruption;
use crate::error::Result;

const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct Fanout {
    /// Byte offset of the last entry in each bucket, filled monotone by
    /// `finalize`.
    fans: Vec<u64>,
    /// Right-shift applied to a hash to obtain its bucket.
    shift: u32,
}

impl Fanout {
    /// Build an empty fan-out sized for `expected_entries` entries of
    /// `entry_size` bytes, keyed by hashes of `hash_bits` bits.
    pub fn new(hash_bits: u32, entry_size: u64, expected_entries: u64) -> Self {
        let entries_per_page = (PAGE_SIZE / entry_size).max(1);
        let wanted = (expected_entries / entries_per_page).max(1);
        let log2 = wanted.next_power_of_two().trailing_zeros().min(hash_bits);
        Self {
            fans: vec![0; 1usize << log2],
            shift: hash_bits - log2,
        }
    }

    fn bucket(&self, hash: u64) -> usize {
        if self.shift >= 64 {
            0
        } else {
            (hash >> self.shift) as usize
        }
    }

    pub fn buckets(&self) -> usize {
        self.fans.len()
    }

    /// Record that an entry with `hash` begins at `offset`. Must be called
    /// for every emitted entry, in ascending hash order.
    pub fn update(&mut self, hash: u64, offset: u64) {
        let bucket = self.bucket(hash);
        self.fans[bucket] = offset;
    }

    /// Fill empty buckets so that `search` always returns a valid enclosing
    /// interval that is monotone in the hash.
    pub fn finalize(&mut self) {
        for i in 1..self.fans.len() {
            if self.fans[i] < self.fans[i - 1] {
                self.fans[i] = self.fans[i - 1];
            }
        }
    }

    /// The byte interval enclosing every entry whose hash is `hash`. Both
    /// bounds are entry-aligned offsets of entries (not an exclusive end).
    pub fn search(&self, hash: u64) -> (u64, u64) {
        let bucket = self.bucket(hash);
        let low = if bucket == 0 { 0 } else { self.fans[bucket - 1] };
        (low, self.fans[bucket])
    }

    /// Serialized size in bytes; known before `export` so header room can
    /// be reserved.
    pub fn exported_size(&self) -> u64 {
        8 + 8 * self.fans.len() as u64
    }

    /// Size-prefixed big-endian serialization.
    pub fn export(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.exported_size() as usize);
        buf.write_u64::<BigEndian>(self.fans.len() as u64)
            .expect("writing to a Vec cannot fail");
        for fan in &self.fans {
            buf.write_u64::<BigEndian>(*fan)
                .expect("writing to a Vec cannot fail");
        }
        buf
    }

    pub fn import(hash_bits: u32, bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| corruption!("truncated fan-out length prefix"))?;
        if count == 0 || !count.is_power_of_two() {
            return Err(corruption!("fan-out bucket count {count} is not a power of two"));
        }
        let log2 = count.trailing_zeros();
        if log2 > hash_bits {
            return Err(corruption!(
                "fan-out has {count} buckets but hashes carry only {hash_bits} bits"
            ));
        }
        if bytes.len() as u64 != 8 + 8 * count {
            return Err(corruption!(
                "fan-out blob is {} bytes, expected {}",
                bytes.len(),
                8 + 8 * count
            ));
        }
        let mut fans = Vec::with_capacity(count as usize);
        for _ in 0..count {
            fans.push(
                cursor
                    .read_u64::<BigEndian>()
                    .map_err(|_| corruption!("truncated fan-out table"))?,
            );
        }
        Ok(Self {
            fans,
            shift: hash_bits - log2,
        })
    }
}
