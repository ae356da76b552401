//! Process-wide instance cache.
//!
//! At most one engine exists per `(canonicalized root, readonly)` pair (and
//! per key/value/backend instantiation); handles opened on the same pair
//! share it through a reference count. The registry is a single global map
//! behind a mutex so multi-threaded hosts stay safe; slots are type-erased
//! because one map serves every `Index<K, V>` instantiation.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::io::{self, Io};
use crate::types::{Key, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    root: PathBuf,
    readonly: bool,
    engine: TypeId,
}

struct Slot<K, V, P> {
    engine: Arc<Mutex<Engine<K, V, P>>>,
    open_instances: usize,
}

type Registry = Mutex<HashMap<SlotKey, Box<dyn Any + Send>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Obtain the shared engine for `(root, config.readonly)`, constructing it
/// if none is cached. Returns the canonicalized root alongside the engine;
/// `release` must later be called with the same root.
pub(crate) fn acquire<K: Key, V: Value, P: Io>(
    root: &Path,
    config: Config,
) -> Result<(PathBuf, Arc<Mutex<Engine<K, V, P>>>)> {
    if !config.readonly {
        std::fs::create_dir_all(root)?;
    }
    // Read-only observers may precede the writer entirely; key them by the
    // literal path until the root exists.
    let root = if root.exists() {
        root.canonicalize()?
    } else {
        root.to_path_buf()
    };

    let mut map = registry().lock()?;

    // A vanished index directory means every cached engine for this root is
    // stale, whatever its mode or instantiation.
    if !io::index_dir(&root).exists() {
        map.retain(|key, _| key.root != root);
    }

    let slot_key = SlotKey {
        root: root.clone(),
        readonly: config.readonly,
        engine: TypeId::of::<Engine<K, V, P>>(),
    };

    if let Some(slot) = map.get_mut(&slot_key) {
        let slot = slot
            .downcast_mut::<Slot<K, V, P>>()
            .ok_or_else(|| Error::InvariantViolation("instance cache slot has wrong type".into()))?;
        if slot.open_instances > 0 {
            slot.open_instances += 1;
            let engine = Arc::clone(&slot.engine);
            if config.fresh {
                if let Err(err) = engine.lock()?.clear() {
                    slot.open_instances -= 1;
                    return Err(err);
                }
            }
            return Ok((root, engine));
        }
    }

    let engine = Arc::new(Mutex::new(Engine::open(&root, config)?));
    map.insert(
        slot_key,
        Box::new(Slot {
            engine: Arc::clone(&engine),
            open_instances: 1,
        }),
    );
    Ok((root, engine))
}

/// Drop one reference to the engine for `(root, readonly)`; the last
/// reference tears the engine down and removes the slot.
pub(crate) fn release<K: Key, V: Value, P: Io>(root: &Path, readonly: bool) -> Result<()> {
    let mut map = registry().lock()?;
    let slot_key = SlotKey {
        root: root.to_path_buf(),
        readonly,
        engine: TypeId::of::<Engine<K, V, P>>(),
    };

    let Some(slot) = map.get_mut(&slot_key) else {
        // Evicted while handles were still live; nothing left to release.
        return Ok(());
    };
    let slot = slot
        .downcast_mut::<Slot<K, V, P>>()
        .ok_or_else(|| Error::InvariantViolation("instance cache slot has wrong type".into()))?;

    slot.open_instances -= 1;
    if slot.open_instances == 0 {
        let engine = Arc::clone(&slot.engine);
        map.remove(&slot_key);
        drop(map);
        engine.lock()?.teardown()?;
    }
    Ok(())
}
