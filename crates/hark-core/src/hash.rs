//! Fast hashing helpers.
//!
//! This module re-exports [`FxHashMap`] and [`FxHashSet`] from the
//! `rustc-hash` crate and provides [`partition_of`], which assigns a path to
//! one of `n` change workers.
//!
//! The Fx hash is not DoS resistant. Keys here are paths on the local
//! filesystem, so that does not matter, and it is considerably faster than
//! SipHash for short string keys.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// A [`HashMap`](std::collections::HashMap) using the Fx hash algorithm.
pub type FxHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// A [`HashSet`](std::collections::HashSet) using the Fx hash algorithm.
pub type FxHashSet<V> = rustc_hash::FxHashSet<V>;

/// Returns the partition (in `0..partitions`) that owns `key`.
///
/// The same key always maps to the same partition for a given partition
/// count. A `partitions` value of zero is treated as one.
///
/// # Examples
///
/// ```
/// use hark_core::partition_of;
///
/// let first = partition_of("lib/a.txt", 4);
/// assert!(first < 4);
/// assert_eq!(first, partition_of("lib/a.txt", 4));
/// assert_eq!(partition_of("lib/a.txt", 1), 0);
/// ```
#[must_use]
pub fn partition_of<K: Hash + ?Sized>(key: &K, partitions: usize) -> usize {
    let partitions = partitions.max(1);
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    // Truncation is fine: the value is reduced modulo a usize anyway.
    #[allow(clippy::cast_possible_truncation)]
    let hash = hasher.finish() as usize;
    hash % partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable() {
        for key in ["a", "lib/a.txt", "deeply/nested/path/file.rs"] {
            assert_eq!(partition_of(key, 7), partition_of(key, 7));
        }
    }

    #[test]
    fn test_partition_in_range() {
        for i in 0..200 {
            let key = format!("file-{i}");
            assert!(partition_of(key.as_str(), 5) < 5);
        }
    }

    #[test]
    fn test_partition_spreads_keys() {
        let mut seen: FxHashSet<usize> = FxHashSet::default();
        for i in 0..200 {
            seen.insert(partition_of(format!("file-{i}").as_str(), 4));
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_zero_partitions() {
        assert_eq!(partition_of("x", 0), 0);
    }
}
