//! The public handle.
//!
//! Handles opened on the same `(root, readonly)` pair share one engine
//! through the process-wide instance cache; the engine is torn down when
//! the last handle closes. A handle is not safe for concurrent use by
//! multiple threads of the same logical caller — operations serialize on
//! the shared engine's mutex, but the single-writer discipline is the
//! caller's responsibility.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::io::{FileIo, Io};
use crate::types::{Key, Value};

pub struct Index<K: Key, V: Value, P: Io = FileIo> {
    engine: Arc<Mutex<Engine<K, V, P>>>,
    root: PathBuf,
    readonly: bool,
    closed: bool,
}

impl<K: Key, V: Value, P: Io> std::fmt::Debug for Index<K, V, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("root", &self.root)
            .field("readonly", &self.readonly)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<K: Key, V: Value, P: Io> Index<K, V, P> {
    /// Open (or share) the index under `root`.
    ///
    /// Writable opens acquire the advisory lock and fail with
    /// `Error::Locked` while another process holds it. Opens on a root
    /// already open in this process with the same mode share the running
    /// engine.
    pub fn open<Q: AsRef<Path>>(root: Q, config: Config) -> Result<Self> {
        let readonly = config.readonly;
        let (root, engine) = cache::acquire::<K, V, P>(root.as_ref(), config)?;
        Ok(Self {
            engine,
            root,
            readonly,
            closed: false,
        })
    }

    fn engine(&self) -> Result<MutexGuard<'_, Engine<K, V, P>>> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(self.engine.lock()?)
    }

    /// Look up the value stored for `key`. Absent keys fail with
    /// `Error::NotFound`; read-only handles first re-sync against the
    /// writer's on-disk state.
    pub fn find(&self, key: &K) -> Result<V> {
        self.engine()?.find(key)
    }

    /// Whether `key` is present.
    pub fn mem(&self, key: &K) -> Result<bool> {
        self.engine()?.mem(key)
    }

    /// Insert or update `key`. Triggers a merge when the log exceeds its
    /// budget.
    pub fn replace(&self, key: &K, value: &V) -> Result<()> {
        self.engine()?.replace(key, value)
    }

    /// Visit every binding: the log mirror first, then the index in file
    /// order. Entries shadowed by the log are visited too — callers needing
    /// deduplication accumulate externally. Return `false` to stop early.
    pub fn iter<F: FnMut(&K, &V) -> bool>(&self, mut visit: F) -> Result<()> {
        self.engine()?.iter(&mut visit)
    }

    /// Erase everything and reset the generation to 0.
    pub fn clear(&self) -> Result<()> {
        self.engine()?.clear()
    }

    /// Fsync the log; completed writes are durable after this returns.
    pub fn flush(&self) -> Result<()> {
        self.engine()?.flush()
    }

    /// Fold the log into the sorted index now, advancing the generation.
    /// A no-op on an empty index.
    pub fn force_merge(&self) -> Result<()> {
        self.engine()?.force_merge()
    }

    /// Close this handle. Idempotent; the shared engine shuts down when the
    /// last handle on its `(root, mode)` closes. Any operation on a closed
    /// handle — including `find` on a read-only one — fails with
    /// `Error::Closed`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        cache::release::<K, V, P>(&self.root, self.readonly)
    }
}

impl<K: Key, V: Value, P: Io> Drop for Index<K, V, P> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io;
    use crate::types::{ByteKey, ByteValue};
    use std::fmt::Display;
    use tempfile::TempDir;

    type TestIndex = Index<ByteKey<20>, ByteValue<20>>;

    fn key(fill: u8) -> ByteKey<20> {
        ByteKey([fill; 20])
    }

    fn value(fill: u8) -> ByteValue<20> {
        ByteValue([fill; 20])
    }

    // Deterministic pseudo-random 20-byte keys.
    fn random_keys(count: usize) -> Vec<ByteKey<20>> {
        let mut state = 0x9e3779b97f4a7c15u64;
        (0..count)
            .map(|i| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let mut bytes = [0u8; 20];
                bytes[..8].copy_from_slice(&state.to_be_bytes());
                bytes[8..16].copy_from_slice(&(i as u64).to_be_bytes());
                ByteKey(bytes)
            })
            .collect()
    }

    fn value_for(key: &ByteKey<20>) -> ByteValue<20> {
        let mut bytes = key.0;
        bytes.reverse();
        ByteValue(bytes)
    }

    #[test]
    fn test_live_roundtrip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let index = TestIndex::open(dir.path(), Config::new(4).fresh(true))
            .expect("Failed to open index");

        index.replace(&key(b'a'), &value(b'b')).expect("Failed to replace");
        let found = index.find(&key(b'a')).expect("Failed to find");
        assert_eq!(found, value(b'b'));
    }

    #[test]
    fn test_restart_preserves_entries() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let mut index = TestIndex::open(dir.path(), Config::new(4).fresh(true))
                .expect("Failed to open index");
            index.replace(&key(b'a'), &value(b'b')).expect("Failed to replace");
            index.close().expect("Failed to close");
        }

        let index = TestIndex::open(dir.path(), Config::new(4)).expect("Failed to reopen index");
        let found = index.find(&key(b'a')).expect("Failed to find after restart");
        assert_eq!(found, value(b'b'));
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let index = TestIndex::open(dir.path(), Config::new(64).fresh(true))
            .expect("Failed to open index");

        for fill in [1u8, 2, 3] {
            index.replace(&key(b'k'), &value(fill)).expect("Failed to replace");
        }
        assert_eq!(index.find(&key(b'k')).expect("Failed to find"), value(3));

        index.force_merge().expect("Failed to merge");
        assert_eq!(index.find(&key(b'k')).expect("Failed to find"), value(3));

        index.replace(&key(b'k'), &value(4)).expect("Failed to replace");
        assert_eq!(index.find(&key(b'k')).expect("Failed to find"), value(4));
    }

    /// A key that advertises 20 encoded bytes but produces 2.
    #[derive(Debug, Clone, PartialEq)]
    struct LyingKey;

    impl Display for LyingKey {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "lying-key")
        }
    }

    impl Key for LyingKey {
        const ENCODED_SIZE: usize = 20;
        const HASH_BITS: u32 = 64;

        fn hash(&self) -> u64 {
            7
        }

        fn encode(&self) -> Vec<u8> {
            vec![b'x'; 2]
        }

        fn decode(_bytes: &[u8]) -> crate::error::Result<Self> {
            Ok(Self)
        }
    }

    #[test]
    fn test_replace_rejects_bad_key_size() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let index = Index::<LyingKey, ByteValue<20>>::open(dir.path(), Config::new(4).fresh(true))
            .expect("Failed to open index");

        let result = index.replace(&LyingKey, &value(b'v'));
        match result {
            Err(Error::InvalidKeySize { expected, found }) => {
                assert_eq!(expected, 20);
                assert_eq!(found, 2);
            }
            other => panic!("Expected InvalidKeySize, got {other:?}"),
        }
    }

    #[test]
    fn test_readonly_handle_syncs_writer_state() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let writer = TestIndex::open(dir.path(), Config::new(200).fresh(true))
            .expect("Failed to open writer");
        let reader = TestIndex::open(dir.path(), Config::new(200).readonly(true))
            .expect("Failed to open reader");

        let keys = random_keys(103);
        for k in &keys {
            writer.replace(k, &value_for(k)).expect("Failed to replace");
        }
        writer.flush().expect("Failed to flush");

        for k in &keys {
            let found = reader.find(k).expect("Reader failed to find key");
            assert_eq!(found, value_for(k));
        }
    }

    #[test]
    fn test_readonly_sees_merges_across_interleavings() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let writer = TestIndex::open(dir.path(), Config::new(1024).fresh(true))
            .expect("Failed to open writer");
        let readers: Vec<_> = (0..3)
            .map(|i| {
                TestIndex::open(dir.path(), Config::new(1024).readonly(true))
                    .unwrap_or_else(|_| panic!("Failed to open reader {i}"))
            })
            .collect();

        let keys = random_keys(20);
        for (i, k) in keys.iter().enumerate() {
            writer.replace(k, &value_for(k)).expect("Failed to replace");
            writer.force_merge().expect("Failed to merge");

            for reader in &readers {
                // Everything merged so far must be visible.
                for seen in &keys[..=i] {
                    let found = reader.find(seen).expect("Reader failed to find merged key");
                    assert_eq!(found, value_for(seen));
                }
                // Nothing from the future leaks in.
                if let Some(next) = keys.get(i + 1) {
                    assert!(!reader.mem(next).expect("mem failed"));
                }
            }
        }
    }

    #[test]
    fn test_open_twice_close_one() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut a = TestIndex::open(dir.path(), Config::new(16).fresh(true))
            .expect("Failed to open handle a");
        let b = TestIndex::open(dir.path(), Config::new(16)).expect("Failed to open handle b");

        a.replace(&key(b'a'), &value(b'1')).expect("Failed to replace");
        a.close().expect("Failed to close handle a");

        // The engine lives on for b.
        assert_eq!(b.find(&key(b'a')).expect("b failed to find"), value(b'1'));

        // The closed handle rejects every operation.
        assert!(matches!(a.find(&key(b'a')), Err(Error::Closed)));
        assert!(matches!(a.replace(&key(b'a'), &value(b'2')), Err(Error::Closed)));
        assert!(a.close().is_ok(), "close must be idempotent");
    }

    #[test]
    fn test_find_on_closed_readonly_handle() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let writer = TestIndex::open(dir.path(), Config::new(16).fresh(true))
            .expect("Failed to open writer");
        writer.replace(&key(b'a'), &value(b'1')).expect("Failed to replace");
        writer.flush().expect("Failed to flush");

        let mut reader = TestIndex::open(dir.path(), Config::new(16).readonly(true))
            .expect("Failed to open reader");
        assert!(reader.mem(&key(b'a')).expect("mem failed"));

        reader.close().expect("Failed to close reader");
        assert!(matches!(reader.find(&key(b'a')), Err(Error::Closed)));
    }

    #[test]
    fn test_shared_instance_sees_writes_without_flush() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let a = TestIndex::open(dir.path(), Config::new(16).fresh(true))
            .expect("Failed to open handle a");
        let b = TestIndex::open(dir.path(), Config::new(16)).expect("Failed to open handle b");

        a.replace(&key(b'x'), &value(b'y')).expect("Failed to replace");
        assert_eq!(b.find(&key(b'x')).expect("b failed to find"), value(b'y'));
    }

    #[test]
    fn test_locked_root_rejects_second_writer() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(io::index_dir(dir.path())).expect("Failed to create index dir");

        // A foreign writer (another process, simulated with a raw lock).
        let _foreign = crate::flock::FileLock::lock(io::lock_path(dir.path()))
            .expect("Failed to take foreign lock");

        match TestIndex::open(dir.path(), Config::new(16)) {
            Err(Error::Locked(_)) => {}
            other => panic!("Expected Locked error, got {other:?}"),
        }
    }

    #[test]
    fn test_readonly_rejects_mutations() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let _writer = TestIndex::open(dir.path(), Config::new(16).fresh(true))
            .expect("Failed to open writer");
        let reader = TestIndex::open(dir.path(), Config::new(16).readonly(true))
            .expect("Failed to open reader");

        assert!(matches!(reader.replace(&key(b'a'), &value(b'b')), Err(Error::ReadOnly)));
        assert!(matches!(reader.clear(), Err(Error::ReadOnly)));
        assert!(matches!(reader.flush(), Err(Error::ReadOnly)));
        assert!(matches!(reader.force_merge(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_clear_resets_writer_and_observer() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let writer = TestIndex::open(dir.path(), Config::new(16).fresh(true))
            .expect("Failed to open writer");

        writer.replace(&key(b'a'), &value(b'1')).expect("Failed to replace");
        writer.force_merge().expect("Failed to merge");
        writer.replace(&key(b'b'), &value(b'2')).expect("Failed to replace");
        writer.flush().expect("Failed to flush");

        let reader = TestIndex::open(dir.path(), Config::new(16).readonly(true))
            .expect("Failed to open reader");
        assert!(reader.mem(&key(b'a')).expect("mem failed"));
        assert!(reader.mem(&key(b'b')).expect("mem failed"));

        writer.clear().expect("Failed to clear");
        assert!(matches!(writer.find(&key(b'a')), Err(Error::NotFound)));
        assert!(matches!(writer.find(&key(b'b')), Err(Error::NotFound)));

        // The observer sees the generation fall back to 0 and drops its view.
        assert!(!reader.mem(&key(b'a')).expect("mem failed after clear"));
        assert!(!reader.mem(&key(b'b')).expect("mem failed after clear"));

        // The store keeps working after the reset.
        writer.replace(&key(b'c'), &value(b'3')).expect("Failed to replace");
        assert_eq!(writer.find(&key(b'c')).expect("find failed"), value(b'3'));
    }

    #[test]
    fn test_log_overflow_triggers_merge() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let index = TestIndex::open(dir.path(), Config::new(4).fresh(true))
            .expect("Failed to open index");

        let keys = random_keys(5);
        for k in &keys {
            index.replace(k, &value_for(k)).expect("Failed to replace");
        }

        // The fifth write overflowed the four-entry budget and merged.
        assert!(io::data_path(dir.path()).exists());
        for k in &keys {
            assert_eq!(index.find(k).expect("find failed"), value_for(k));
        }
    }

    #[test]
    fn test_many_merges_then_restart() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let keys = random_keys(64);
        {
            let mut index = TestIndex::open(dir.path(), Config::new(4).fresh(true))
                .expect("Failed to open index");
            for k in &keys {
                index.replace(k, &value_for(k)).expect("Failed to replace");
            }
            index.close().expect("Failed to close");
        }

        let index = TestIndex::open(dir.path(), Config::new(4)).expect("Failed to reopen");
        for k in &keys {
            assert_eq!(index.find(k).expect("find failed after restart"), value_for(k));
        }
    }

    #[test]
    fn test_iter_visits_shadowed_entries() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let index = TestIndex::open(dir.path(), Config::new(16).fresh(true))
            .expect("Failed to open index");

        index.replace(&key(b'k'), &value(1)).expect("Failed to replace");
        index.force_merge().expect("Failed to merge");
        index.replace(&key(b'k'), &value(2)).expect("Failed to replace");

        let mut seen = Vec::new();
        index
            .iter(|k, v| {
                seen.push((k.clone(), v.clone()));
                true
            })
            .expect("iter failed");

        // Mirror first (fresh value), then the stale index entry.
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (key(b'k'), value(2)));
        assert_eq!(seen[1], (key(b'k'), value(1)));
    }

    #[test]
    fn test_iter_stops_early() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let index = TestIndex::open(dir.path(), Config::new(16).fresh(true))
            .expect("Failed to open index");

        for fill in 1..=5u8 {
            index.replace(&key(fill), &value(fill)).expect("Failed to replace");
        }

        let mut visited = 0;
        index
            .iter(|_, _| {
                visited += 1;
                visited < 2
            })
            .expect("iter failed");
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_fresh_open_truncates() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let mut index = TestIndex::open(dir.path(), Config::new(4).fresh(true))
                .expect("Failed to open index");
            let keys = random_keys(8);
            for k in &keys {
                index.replace(k, &value_for(k)).expect("Failed to replace");
            }
            index.close().expect("Failed to close");
        }

        let index = TestIndex::open(dir.path(), Config::new(4).fresh(true))
            .expect("Failed to reopen fresh");
        assert!(!index.mem(&random_keys(1)[0]).expect("mem failed"));
    }

    #[test]
    fn test_generation_advances_per_merge() {
        use crate::io::{FileIo, Io as _};

        let dir = TempDir::new().expect("Failed to create temp dir");
        let index = TestIndex::open(dir.path(), Config::new(1024).fresh(true))
            .expect("Failed to open index");

        let keys = random_keys(3);
        for (i, k) in keys.iter().enumerate() {
            index.replace(k, &value_for(k)).expect("Failed to replace");
            index.force_merge().expect("Failed to merge");

            let log = FileIo::open(&io::log_path(dir.path()), true)
                .expect("Failed to open log header");
            assert_eq!(log.generation(), i as u64 + 1);
            let data = FileIo::open(&io::data_path(dir.path()), true)
                .expect("Failed to open data header");
            assert_eq!(data.generation(), i as u64 + 1);
        }
    }
}
