use std::marker::PhantomData;

use crate::entry::Entry;
use crate::error::Result;
use crate::io::Io;
use crate::types::{Key, Value};

/// The sorted index file viewed as a random-access array of fixed-size
/// entries.
///
/// Callers obtain bounds from the fan-out; reading out of bounds is a
/// programmer error and surfaces as an I/O failure.
pub struct FileArray<'a, K, V, P> {
    io: &'a P,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: Key, V: Value, P: Io> FileArray<'a, K, V, P> {
    pub fn new(io: &'a P) -> Self {
        Self {
            io,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> u64 {
        self.io.offset() / Entry::<K, V>::disk_size() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read and decode the entry at index `i`.
    pub fn get(&self, i: u64) -> Result<Entry<K, V>> {
        let entry_size = Entry::<K, V>::disk_size();
        let mut buf = vec![0u8; entry_size];
        self.io.read_at(i * entry_size as u64, &mut buf)?;
        Entry::decode(&buf)
    }
}
