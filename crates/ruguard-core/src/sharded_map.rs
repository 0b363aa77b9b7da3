//! Sharded concurrent hash map for hot-path governance state
//!
//! Replaces `RwLock<HashMap<K, V>>` with a cache-line-padded, sharded map
//! that spreads entries across independent lock shards. Queries touching
//! different groups or fingerprints never contend on the same lock.
//!
//! # Design
//!
//! Each shard is a `RwLock<HashMap<K, V>>` padded to 128 bytes. Key hashing
//! determines the shard. [`ShardedMap::sweep_shard`] lets a background task
//! visit one bounded slice of one shard per call; each shard remembers where
//! the previous sweep stopped so repeated sweeps cover every entry.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default number of shards. Power of 2 for fast modulo.
pub const DEFAULT_SHARDS: usize = 64;

// ---------------------------------------------------------------------------
// Shard key hashing
// ---------------------------------------------------------------------------

#[inline]
fn hash_key<K: Hash + ?Sized>(key: &K, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

// ---------------------------------------------------------------------------
// Padded shard
// ---------------------------------------------------------------------------

/// 128-byte alignment prevents false sharing between adjacent shards.
#[repr(align(128))]
struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
    /// Iteration index the next sweep starts from. Only touched under the
    /// write lock.
    sweep_from: AtomicUsize,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            sweep_from: AtomicUsize::new(0),
        }
    }
}

/// Result of one [`ShardedMap::sweep_shard`] call.
#[derive(Debug)]
pub struct ShardSweep<K, V> {
    pub removed: Vec<(K, V)>,
    /// Entries visited, removed ones included.
    pub inspected: usize,
}

// ---------------------------------------------------------------------------
// ShardedMap
// ---------------------------------------------------------------------------

/// A sharded concurrent hash map.
///
/// Thread-safe without external locking. Operations on different keys
/// are fully concurrent unless they hash to the same shard.
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    shard_count: usize,
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shard_count", &self.shard_count)
            .finish()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a new sharded map with the default shard count (64).
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create with a specific shard count.
    ///
    /// Clamped to `[1, 256]`.
    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        let n = n.clamp(1, 256);
        let shards: Vec<Shard<K, V>> = (0..n).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            shard_count: n,
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    #[inline]
    fn shard_idx(&self, key: &K) -> usize {
        hash_key(key, self.shard_count)
    }

    /// Insert or update a key-value pair. Returns the old value if any.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let idx = self.shard_idx(&key);
        let mut guard = self.shards[idx]
            .map
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(key, value)
    }

    /// Get a clone of the value for a key.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let idx = self.shard_idx(key);
        let guard = self.shards[idx]
            .map
            .read()
            .unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    /// Get the value for `key`, inserting `make()` first when absent.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        let idx = self.shard_idx(&key);
        {
            let guard = self.shards[idx]
                .map
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(value) = guard.get(&key) {
                return value.clone();
            }
        }
        let mut guard = self.shards[idx]
            .map
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.entry(key).or_insert_with(make).clone()
    }

    /// Remove a key and return its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let idx = self.shard_idx(key);
        let mut guard = self.shards[idx]
            .map
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.remove(key)
    }

    /// Remove a key only if `pred` holds for its current value.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let idx = self.shard_idx(key);
        let mut guard = self.shards[idx]
            .map
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if guard.get(key).is_some_and(pred) {
            guard.remove(key)
        } else {
            None
        }
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.map.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.shards
            .iter()
            .all(|s| s.map.read().unwrap_or_else(|e| e.into_inner()).is_empty())
    }

    /// Update the value under `key` in place, or insert `make()` when absent.
    ///
    /// Returns `true` when a new entry was inserted.
    pub fn upsert_with<M, U>(&self, key: K, make: M, update: U) -> bool
    where
        M: FnOnce() -> V,
        U: FnOnce(&mut V),
    {
        let idx = self.shard_idx(&key);
        let mut guard = self.shards[idx]
            .map
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = guard.get_mut(&key) {
            update(existing);
            false
        } else {
            guard.insert(key, make());
            true
        }
    }

    /// Collect all values (snapshot).
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut result = Vec::new();
        for shard in self.shards.iter() {
            let guard = shard.map.read().unwrap_or_else(|e| e.into_inner());
            result.extend(guard.values().cloned());
        }
        result
    }

    /// Remove every entry for which `pred` returns `false`, returning the
    /// removed pairs.
    pub fn retain<F>(&self, mut pred: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.map.write().unwrap_or_else(|e| e.into_inner());
            let doomed: Vec<K> = guard
                .iter()
                .filter(|(k, v)| !pred(k, v))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(value) = guard.remove(&key) {
                    removed.push((key, value));
                }
            }
        }
        removed
    }

    /// Visit at most `budget` entries of one shard, resuming where the
    /// previous sweep of that shard stopped and wrapping at the end, and
    /// remove those matching `doomed`.
    ///
    /// `shard` is taken modulo the shard count so callers can keep a plain
    /// rotating cursor. Removals keep the iteration order of the remaining
    /// entries, so the resume index stays exact unless an insert grows the
    /// shard in between.
    pub fn sweep_shard<F>(&self, shard: usize, budget: usize, mut doomed: F) -> ShardSweep<K, V>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let shard = &self.shards[shard % self.shard_count];
        let mut guard = shard.map.write().unwrap_or_else(|e| e.into_inner());
        let len = guard.len();
        let take = budget.min(len);
        if take == 0 {
            return ShardSweep {
                removed: Vec::new(),
                inspected: 0,
            };
        }

        let start = match shard.sweep_from.load(Ordering::Relaxed) {
            from if from < len => from,
            _ => 0,
        };
        let end = start + take;
        let in_window = |pos: usize| {
            if end <= len {
                (start..end).contains(&pos)
            } else {
                pos >= start || pos < end - len
            }
        };
        let victims: Vec<(usize, K)> = guard
            .iter()
            .enumerate()
            .filter(|(pos, (k, v))| in_window(*pos) && doomed(*k, *v))
            .map(|(pos, (k, _))| (pos, k.clone()))
            .collect();

        let resume = end % len;
        let shifted = victims.iter().filter(|(pos, _)| *pos < resume).count();
        shard.sweep_from.store(resume - shifted, Ordering::Relaxed);

        let removed = victims
            .into_iter()
            .filter_map(|(_, key)| guard.remove(&key).map(|value| (key, value)))
            .collect();
        ShardSweep {
            removed,
            inspected: take,
        }
    }

    /// Take every entry out of the map, shard by shard.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.map.write().unwrap_or_else(|e| e.into_inner());
            drained.extend(guard.drain());
            shard.sweep_from.store(0, Ordering::Relaxed);
        }
        drained
    }
}

impl<K: Hash + Eq + Clone, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
