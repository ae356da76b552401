//! The storage engine: an append-only log absorbed into a sorted index.
//!
//! Writes land in the log file and its in-memory mirror; once the log
//! exceeds its byte budget the mirror is folded into a fresh sorted index
//! file which is renamed over the old one, and the generation counter
//! advances so read-only observers can detect the swap and re-sync.

use std::marker::PhantomData;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crossbeam_skiplist::SkipMap;
use itertools::Itertools as _;

use crate::config::Config;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::fanout::Fanout;
use crate::file_array::FileArray;
use crate::flock::FileLock;
use crate::io::{self, Io};
use crate::search;
use crate::types::{Key, Value};

/// Read granularity, in entries, for log replay and index scans.
const SCAN_CHUNK_ENTRIES: usize = 1024;

/// The append-only log file and its in-memory mirror, keyed by encoded key
/// bytes. Later writes win.
struct Log<P> {
    io: P,
    mirror: SkipMap<Vec<u8>, Vec<u8>>,
    /// Payload bytes already absorbed into the mirror; only read-only
    /// observers advance this incrementally.
    read_offset: u64,
}

/// The sorted, immutable index file and its fan-out.
struct Sorted<P> {
    io: P,
    fanout: Fanout,
}

pub(crate) struct Engine<K, V, P> {
    root: PathBuf,
    config: Config,
    generation: u64,
    log: Option<Log<P>>,
    index: Option<Sorted<P>>,
    lock: Option<FileLock>,
    open: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, P> std::fmt::Debug for Engine<K, V, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("generation", &self.generation)
            .field("open", &self.open)
            .finish()
    }
}

/// Sink for the streaming merge: records each emitted entry in the fan-out
/// before appending it.
struct MergeOut<'a, P> {
    io: &'a mut P,
    fanout: &'a mut Fanout,
    offset: u64,
    entry_size: u64,
}

impl<P: Io> MergeOut<'_, P> {
    fn emit(&mut self, hash: u64, bytes: &[u8]) -> Result<()> {
        self.fanout.update(hash, self.offset);
        self.io.append(bytes)?;
        self.offset += self.entry_size;
        Ok(())
    }
}

impl<K: Key, V: Value, P: Io> Engine<K, V, P> {
    fn entry_size() -> u64 {
        Entry::<K, V>::disk_size() as u64
    }

    pub(crate) fn open(root: &Path, config: Config) -> Result<Self> {
        let lock = if config.readonly {
            None
        } else {
            std::fs::create_dir_all(io::index_dir(root))?;
            Some(FileLock::lock(io::lock_path(root))?)
        };

        let log_path = io::log_path(root);
        let mut generation = 0;
        let mut log = None;

        if !config.readonly {
            let mut log_io = if P::exists(&log_path) {
                P::open(&log_path, false)?
            } else {
                P::create(&log_path, 0, 0)?
            };
            if config.fresh {
                log_io.clear(0)?;
                P::remove(&io::data_path(root))?;
            }
            generation = log_io.generation();
            let mirror = SkipMap::new();
            let mut read_offset = Self::load_mirror(&log_io, &mirror, 0)?;
            if read_offset != log_io.offset() {
                // A crash tore the last append. Rewrite the surviving
                // prefix so new appends land on an entry boundary.
                tracing::warn!(
                    root = %root.display(),
                    torn_bytes = log_io.offset() - read_offset,
                    "log ends in a torn write, rewriting"
                );
                log_io.clear(generation)?;
                for entry in mirror.iter() {
                    log_io.append(entry.key())?;
                    log_io.append(entry.value())?;
                }
                log_io.sync()?;
                read_offset = log_io.offset();
            }
            log = Some(Log {
                io: log_io,
                mirror,
                read_offset,
            });
        } else if P::exists(&log_path) {
            let log_io = P::open(&log_path, true)?;
            generation = log_io.generation();
            let mirror = SkipMap::new();
            let read_offset = Self::load_mirror(&log_io, &mirror, 0)?;
            log = Some(Log {
                io: log_io,
                mirror,
                read_offset,
            });
        }

        let data_path = io::data_path(root);
        let index = if P::exists(&data_path) {
            Some(Self::open_sorted(&data_path)?)
        } else {
            None
        };

        tracing::debug!(
            root = %root.display(),
            readonly = config.readonly,
            generation,
            "opened index"
        );

        Ok(Self {
            root: root.to_path_buf(),
            config,
            generation,
            log,
            index,
            lock,
            open: true,
            _marker: PhantomData,
        })
    }

    fn open_sorted(path: &Path) -> Result<Sorted<P>> {
        let sorted_io = P::open(path, true)?;
        let blob = sorted_io.read_fanout()?;
        let fanout = Fanout::import(K::HASH_BITS, &blob)?;
        Ok(Sorted {
            io: sorted_io,
            fanout,
        })
    }

    /// Replay the log payload from `from` into the mirror, in file order so
    /// the last occurrence of a key wins. A trailing fragment shorter than
    /// one entry is ignored. Returns the new absorbed offset.
    fn load_mirror(log_io: &P, mirror: &SkipMap<Vec<u8>, Vec<u8>>, from: u64) -> Result<u64> {
        let entry_size = Self::entry_size();
        let end = (log_io.offset() / entry_size) * entry_size;
        let mut buf = vec![0u8; SCAN_CHUNK_ENTRIES * entry_size as usize];
        let mut pos = from;
        while pos < end {
            let len = (end - pos).min(buf.len() as u64) as usize;
            log_io.read_at(pos, &mut buf[..len])?;
            for chunk in buf[..len].chunks_exact(entry_size as usize) {
                let (key_bytes, value_bytes) = chunk.split_at(K::ENCODED_SIZE);
                mirror.insert(key_bytes.to_vec(), value_bytes.to_vec());
            }
            pos += len as u64;
        }
        Ok(end)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.config.readonly {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn log_mut(&mut self) -> Result<&mut Log<P>> {
        self.log
            .as_mut()
            .ok_or_else(|| Error::InvariantViolation("log file is not open".into()))
    }

    pub(crate) fn replace(&mut self, key: &K, value: &V) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;

        let key_bytes = key.encode();
        if key_bytes.len() != K::ENCODED_SIZE {
            return Err(Error::InvalidKeySize {
                expected: K::ENCODED_SIZE,
                found: key_bytes.len(),
            });
        }
        let value_bytes = value.encode();
        if value_bytes.len() != V::ENCODED_SIZE {
            return Err(Error::InvalidValueSize {
                expected: V::ENCODED_SIZE,
                found: value_bytes.len(),
            });
        }

        let budget = self.config.log_size_bytes(Entry::<K, V>::disk_size());
        let overflow = {
            let log = self.log_mut()?;
            let mut record = Vec::with_capacity(key_bytes.len() + value_bytes.len());
            record.extend_from_slice(&key_bytes);
            record.extend_from_slice(&value_bytes);
            log.io.append(&record)?;
            log.mirror.insert(key_bytes, value_bytes);
            log.io.offset() > budget
        };

        if overflow {
            self.merge(Entry::new(key.clone(), value.clone()))?;
        }
        Ok(())
    }

    pub(crate) fn find(&mut self, key: &K) -> Result<V> {
        self.ensure_open()?;
        if self.config.readonly {
            self.sync_log()?;
        }

        let Some(log) = &self.log else {
            return Err(Error::NotFound);
        };
        if let Some(entry) = log.mirror.get(key.encode().as_slice()) {
            return V::decode(entry.value());
        }

        match &self.index {
            Some(sorted) => {
                let array = FileArray::new(&sorted.io);
                match search::interpolation_search(&array, &sorted.fanout, key)? {
                    Some(value) => Ok(value),
                    None => Err(Error::NotFound),
                }
            }
            None => Err(Error::NotFound),
        }
    }

    pub(crate) fn mem(&mut self, key: &K) -> Result<bool> {
        match self.find(key) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Visit the log mirror, then the index in file order. Shadowed index
    /// entries are visited too; callers needing deduplication accumulate
    /// externally. Returning `false` from the visitor stops the iteration.
    pub(crate) fn iter(&mut self, visit: &mut dyn FnMut(&K, &V) -> bool) -> Result<()> {
        self.ensure_open()?;
        if self.config.readonly {
            self.sync_log()?;
        }

        let Some(log) = &self.log else {
            return Ok(());
        };
        for entry in log.mirror.iter() {
            let key = K::decode(entry.key())?;
            let value = V::decode(entry.value())?;
            if !visit(&key, &value) {
                return Ok(());
            }
        }

        if let Some(sorted) = &self.index {
            let entry_size = Self::entry_size();
            let end = (sorted.io.offset() / entry_size) * entry_size;
            let mut buf = vec![0u8; SCAN_CHUNK_ENTRIES * entry_size as usize];
            let mut pos = 0u64;
            while pos < end {
                let len = (end - pos).min(buf.len() as u64) as usize;
                sorted.io.read_at(pos, &mut buf[..len])?;
                for chunk in buf[..len].chunks_exact(entry_size as usize) {
                    let entry = Entry::<K, V>::decode(chunk)?;
                    if !visit(&entry.key, &entry.value) {
                        return Ok(());
                    }
                }
                pos += len as u64;
            }
        }
        Ok(())
    }

    /// Reset to empty: generation back to 0, log truncated, mirror cleared,
    /// index dropped and unlinked. Not durable; read-only observers pick the
    /// reset up through the generation change.
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;

        self.generation = 0;
        let log = self.log_mut()?;
        log.io.clear(0)?;
        log.mirror = SkipMap::new();
        log.read_offset = 0;

        if self.index.take().is_some() {
            // Leaving the file behind would resurrect stale entries on the
            // next open.
            P::remove(&io::data_path(&self.root))?;
        }

        tracing::info!(root = %self.root.display(), "cleared index");
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        self.log_mut()?.io.sync()
    }

    pub(crate) fn force_merge(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;

        match self.witness()? {
            Some(witness) => self.merge(witness),
            None => {
                tracing::debug!(root = %self.root.display(), "no entries, skipping merge");
                Ok(())
            }
        }
    }

    /// Any entry proving there is data to merge: first from the mirror,
    /// else the first index entry.
    fn witness(&self) -> Result<Option<Entry<K, V>>> {
        if let Some(log) = &self.log {
            if let Some(entry) = log.mirror.front() {
                let key = K::decode(entry.key())?;
                let value = V::decode(entry.value())?;
                return Ok(Some(Entry::new(key, value)));
            }
        }
        if let Some(sorted) = &self.index {
            let array = FileArray::<K, V, P>::new(&sorted.io);
            if !array.is_empty() {
                return Ok(Some(array.get(0)?));
            }
        }
        Ok(None)
    }

    /// Fold the log into a fresh sorted index under `generation + 1`.
    ///
    /// The two files are merged in non-decreasing hash order into a
    /// temporary file that is renamed over the index, so readers only ever
    /// observe old-index/old-generation or new-index/new-generation. On
    /// equal hash, log entries are emitted first and an index entry is
    /// dropped when an equal-hash log entry carries the same key.
    fn merge(&mut self, witness: Entry<K, V>) -> Result<()> {
        let entry_size = Self::entry_size();
        let new_generation = self.generation + 1;

        let log = self
            .log
            .as_ref()
            .ok_or_else(|| Error::InvariantViolation("writable index has no log".into()))?;

        // Snapshot the mirror sorted by hash. The sort is stable, keeping
        // mirror iteration order among equal hashes.
        let snapshot: Vec<(u64, Vec<u8>)> = log
            .mirror
            .iter()
            .map(|entry| -> Result<(u64, Vec<u8>)> {
                let hash = K::decode(entry.key())?.hash();
                let mut bytes = Vec::with_capacity(entry_size as usize);
                bytes.extend_from_slice(entry.key());
                bytes.extend_from_slice(entry.value());
                Ok((hash, bytes))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .sorted_by_key(|(hash, _)| *hash)
            .collect();

        let index_entries = match &self.index {
            Some(sorted) => sorted.io.offset() / entry_size,
            None => 0,
        };
        let mut fanout = Fanout::new(
            K::HASH_BITS,
            entry_size,
            index_entries + snapshot.len() as u64,
        );

        let merge_file = io::merge_path(&self.root);
        let mut merge_io = P::create(&merge_file, new_generation, fanout.exported_size())?;

        {
            let mut out = MergeOut {
                io: &mut merge_io,
                fanout: &mut fanout,
                offset: 0,
                entry_size,
            };
            let mut next = 0usize;
            if let Some(sorted) = &self.index {
                // The log entries sharing the hash of the current index run
                // are emitted once, ahead of the run, and remembered so each
                // index entry of the run can be checked for shadowing.
                let mut run: Option<(u64, Range<usize>)> = None;
                let end = index_entries * entry_size;
                let mut buf = vec![0u8; SCAN_CHUNK_ENTRIES * entry_size as usize];
                let mut pos = 0u64;
                while pos < end {
                    let len = (end - pos).min(buf.len() as u64) as usize;
                    sorted.io.read_at(pos, &mut buf[..len])?;
                    for chunk in buf[..len].chunks_exact(entry_size as usize) {
                        let hash = K::decode(&chunk[..K::ENCODED_SIZE])?.hash();
                        let log_run = match &run {
                            Some((run_hash, range)) if *run_hash == hash => range.clone(),
                            _ => {
                                while next < snapshot.len() && snapshot[next].0 < hash {
                                    out.emit(snapshot[next].0, &snapshot[next].1)?;
                                    next += 1;
                                }
                                let start = next;
                                while next < snapshot.len() && snapshot[next].0 == hash {
                                    out.emit(hash, &snapshot[next].1)?;
                                    next += 1;
                                }
                                run = Some((hash, start..next));
                                start..next
                            }
                        };
                        let shadowed = snapshot[log_run]
                            .iter()
                            .any(|(_, bytes)| bytes[..K::ENCODED_SIZE] == chunk[..K::ENCODED_SIZE]);
                        if !shadowed {
                            out.emit(hash, chunk)?;
                        }
                    }
                    pos += len as u64;
                }
            }
            while next < snapshot.len() {
                out.emit(snapshot[next].0, &snapshot[next].1)?;
                next += 1;
            }
        }

        fanout.finalize();
        merge_io.write_fanout(&fanout.export())?;
        merge_io.sync()?;
        drop(merge_io);

        // Atomic swap. A crash before the rename leaves the old state
        // intact; after it, stale log entries re-merge harmlessly.
        self.index = None;
        let data_file = io::data_path(&self.root);
        P::rename(&merge_file, &data_file)?;
        self.index = Some(Sorted {
            io: P::open(&data_file, true)?,
            fanout,
        });

        let log = self.log_mut()?;
        log.io.clear(new_generation)?;
        log.mirror = SkipMap::new();
        log.read_offset = 0;
        self.generation = new_generation;

        tracing::info!(
            generation = new_generation,
            log_entries = snapshot.len(),
            index_entries,
            witness = %witness.key,
            "merged log into index"
        );
        Ok(())
    }

    /// Bring a read-only engine up to date with the writer: absorb new log
    /// entries, and on a generation change reload the mirror and reopen the
    /// index.
    fn sync_log(&mut self) -> Result<()> {
        let mut newly_opened = false;
        if self.log.is_none() {
            let log_path = io::log_path(&self.root);
            if !P::exists(&log_path) {
                return Ok(());
            }
            let log_io = P::open(&log_path, true)?;
            let mirror = SkipMap::new();
            let read_offset = Self::load_mirror(&log_io, &mirror, 0)?;
            self.log = Some(Log {
                io: log_io,
                mirror,
                read_offset,
            });
            newly_opened = true;
        }

        let (disk_generation, new_offset) = {
            let log = self
                .log
                .as_mut()
                .ok_or_else(|| Error::InvariantViolation("sync_log lost its log".into()))?;
            let generation = if newly_opened {
                log.io.generation()
            } else {
                log.io.read_generation()?
            };
            (generation, log.io.force_offset()?)
        };

        if disk_generation != self.generation {
            tracing::debug!(
                from = self.generation,
                to = disk_generation,
                "observed merged generation, re-syncing"
            );
            if !newly_opened {
                let log = self.log_mut()?;
                log.mirror = SkipMap::new();
                log.read_offset = Self::load_mirror(&log.io, &log.mirror, 0)?;
            }
            self.index = None;
            if disk_generation > 0 {
                self.index = Some(Self::open_sorted(&io::data_path(&self.root))?);
            }
            self.generation = disk_generation;
        } else {
            let log = self.log_mut()?;
            if new_offset > log.read_offset {
                log.read_offset = Self::load_mirror(&log.io, &log.mirror, log.read_offset)?;
            } else if new_offset < log.read_offset {
                return Err(Error::InvariantViolation(format!(
                    "log shrank from {} to {} bytes without a generation change",
                    log.read_offset, new_offset
                )));
            }
        }
        Ok(())
    }

    /// Release every resource. Called by the instance cache when the last
    /// handle closes; afterwards every operation fails with `Closed`.
    pub(crate) fn teardown(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if !self.config.readonly {
            if let Some(log) = self.log.as_mut() {
                log.io.sync()?;
            }
        }
        self.log = None;
        self.index = None;
        if let Some(lock) = self.lock.take() {
            lock.unlock()?;
        }
        tracing::debug!(root = %self.root.display(), "closed index");
        Ok(())
    }
}
