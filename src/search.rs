//! Interpolation search over the sorted index file.
//!
//! The fan-out narrows the probe range to one hash-prefix bucket; within
//! the bucket the next probe position is predicted by linear interpolation
//! in hash space. Uniform hashes give expected O(log log n) probes; skewed
//! hashes degrade toward a scan but never lose correctness.

use crate::error::Result;
use crate::fanout::Fanout;
use crate::file_array::FileArray;
use crate::io::Io;
use crate::types::{Key, Value};

/// Deterministic pivot rounding: `ceil(x - 0.5)`, biasing ties toward the
/// lower half.
fn round_pivot(x: f64) -> u64 {
    (x - 0.5).ceil() as u64
}

/// Search the sorted file for `key` within the interval its hash maps to.
pub fn interpolation_search<K: Key, V: Value, P: Io>(
    array: &FileArray<K, V, P>,
    fanout: &Fanout,
    key: &K,
) -> Result<Option<V>> {
    if array.is_empty() {
        return Ok(None);
    }

    let entry_size = (K::ENCODED_SIZE + V::ENCODED_SIZE) as u64;
    let hash = key.hash();
    let (low_bytes, high_bytes) = fanout.search(hash);
    let mut low = low_bytes / entry_size;
    let mut high = high_bytes / entry_size;

    while low <= high {
        let entry_low = array.get(low)?;
        let entry_high = array.get(high)?;

        if hash < entry_low.hash || hash > entry_high.hash {
            return Ok(None);
        }

        if entry_low.hash == entry_high.hash {
            // The whole interval shares one hash: compare keys directly.
            for i in low..=high {
                let entry = array.get(i)?;
                if entry.hash == hash && entry.key == *key {
                    return Ok(Some(entry.value));
                }
            }
            return Ok(None);
        }

        let fraction = (hash - entry_low.hash) as f64 / (entry_high.hash - entry_low.hash) as f64;
        let pivot = low as f64 + fraction * (high - low) as f64;
        let mid = round_pivot(pivot).clamp(low, high);

        let entry_mid = array.get(mid)?;
        if entry_mid.hash < hash {
            low = mid + 1;
        } else if entry_mid.hash > hash {
            // mid == 0 would imply hash < entry_low.hash, caught above.
            high = mid - 1;
        } else {
            return scan_run(array, hash, key, low, mid, high);
        }
    }

    Ok(None)
}

/// Scan the run of equal-hash entries around `mid` left to right. Starting
/// from the leftmost run member means merge-ordered duplicates resolve to
/// the freshest value.
fn scan_run<K: Key, V: Value, P: Io>(
    array: &FileArray<K, V, P>,
    hash: u64,
    key: &K,
    low: u64,
    mid: u64,
    high: u64,
) -> Result<Option<V>> {
    let mut i = mid;
    while i > low && array.get(i - 1)?.hash == hash {
        i -= 1;
    }
    while i <= high {
        let entry = array.get(i)?;
        if entry.hash != hash {
            break;
        }
        if entry.key == *key {
            return Ok(Some(entry.value));
        }
        i += 1;
    }
    Ok(None)
}
