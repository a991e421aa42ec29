//! Keyed entity store
//!
//! All per-vehicle state (stream states, switch requests, command records)
//! lives behind [`KeyedStore`]: a map from key to entity with atomic
//! read-modify-write per key and optional TTL expiry. The in-process
//! implementation is [`MemoryStore`]; a shared store (e.g. Redis) can slot in
//! behind the same trait.

mod memory;

pub use memory::MemoryStore;

/// Map from key to entity with per-key atomic updates.
///
/// Time is passed in explicitly (epoch ms) so expiry is deterministic.
pub trait KeyedStore<K, V>: Send + Sync {
    /// Current value, `None` when absent or expired.
    fn get(&self, key: &K, now_ms: u64) -> Option<V>;

    /// Atomically read-modify-write one key.
    ///
    /// `f` is called exactly once with the current value (`None` when absent
    /// or expired). Leaving `None` in the slot deletes the key. No other
    /// update to the same key can interleave with `f`.
    fn update(&self, key: &K, now_ms: u64, f: &mut dyn FnMut(&mut Option<V>));

    /// Remove a key, returning the last value.
    fn remove(&self, key: &K) -> Option<V>;

    /// All live keys.
    fn keys(&self, now_ms: u64) -> Vec<K>;

    /// Drop expired entries. Returns how many were removed.
    fn purge_expired(&self, now_ms: u64) -> usize;
}
