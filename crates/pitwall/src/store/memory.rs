//! In-process keyed store backed by `DashMap`.
//!
//! DashMap shards its table behind per-shard locks, so an update on one key
//! never blocks the whole store, and holding the entry guard for the duration
//! of the closure makes each update atomic for its key.

use std::hash::Hash;

use dashmap::DashMap;

use super::KeyedStore;

struct Slot<V> {
    value: Option<V>,
    /// Epoch ms after which the value reads as absent
    expires_at: Option<u64>,
}

impl<V> Slot<V> {
    fn live(&self, now_ms: u64) -> bool {
        self.value.is_some() && self.expires_at.map_or(true, |t| now_ms < t)
    }
}

/// `KeyedStore` held in process memory.
pub struct MemoryStore<K, V> {
    entries: DashMap<K, Slot<V>>,
    ttl_ms: Option<u64>,
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Store whose entries never expire.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms: None,
        }
    }

    /// Store whose entries expire `ttl_ms` after creation.
    ///
    /// Updates to an existing entry keep its original expiry.
    pub fn with_ttl(ttl_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms: Some(ttl_ms),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for MemoryStore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K, now_ms: u64) -> Option<V> {
        let slot = self.entries.get(key)?;
        if slot.live(now_ms) {
            slot.value.clone()
        } else {
            None
        }
    }

    fn update(&self, key: &K, now_ms: u64, f: &mut dyn FnMut(&mut Option<V>)) {
        let emptied = {
            let mut slot = self.entries.entry(key.clone()).or_insert_with(|| Slot {
                value: None,
                expires_at: None,
            });
            if !slot.live(now_ms) {
                slot.value = None;
                slot.expires_at = None;
            }

            let was_present = slot.value.is_some();
            f(&mut slot.value);

            if slot.value.is_none() {
                true
            } else {
                if !was_present {
                    slot.expires_at = self.ttl_ms.map(|ttl| now_ms.saturating_add(ttl));
                }
                false
            }
        };

        if emptied {
            self.entries.remove_if(key, |_, slot| slot.value.is_none());
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).and_then(|(_, slot)| slot.value)
    }

    fn keys(&self, now_ms: u64) -> Vec<K> {
        self.entries
            .iter()
            .filter(|e| e.value().live(now_ms))
            .map(|e| e.key().clone())
            .collect()
    }

    fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.live(now_ms));
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn update_inserts_and_modifies() {
        let store: MemoryStore<&str, u32> = MemoryStore::new();
        store.update(&"a", 0, &mut |slot| *slot = Some(1));
        store.update(&"a", 0, &mut |slot| {
            if let Some(v) = slot {
                *v += 1;
            }
        });
        assert_eq!(store.get(&"a", 0), Some(2));
        assert_eq!(store.keys(0), vec!["a"]);
    }

    #[test]
    fn leaving_none_deletes() {
        let store: MemoryStore<&str, u32> = MemoryStore::new();
        store.update(&"a", 0, &mut |slot| *slot = Some(1));
        store.update(&"a", 0, &mut |slot| *slot = None);
        assert_eq!(store.get(&"a", 0), None);
        assert!(store.is_empty());
    }

    #[test]
    fn ttl_expires_from_creation() {
        let store: MemoryStore<&str, u32> = MemoryStore::with_ttl(100);
        store.update(&"a", 1_000, &mut |slot| *slot = Some(1));
        // A later write does not extend the lifetime
        store.update(&"a", 1_050, &mut |slot| *slot = Some(2));
        assert_eq!(store.get(&"a", 1_099), Some(2));
        assert_eq!(store.get(&"a", 1_100), None);

        let mut seen = Some(0);
        store.update(&"a", 1_200, &mut |slot| seen = slot.clone());
        assert_eq!(seen, None, "expired entries read as absent inside update");
    }

    #[test]
    fn purge_drops_expired() {
        let store: MemoryStore<u32, u32> = MemoryStore::with_ttl(10);
        store.update(&1, 0, &mut |slot| *slot = Some(1));
        store.update(&2, 5, &mut |slot| *slot = Some(2));
        assert_eq!(store.purge_expired(12), 1);
        assert_eq!(store.keys(12), vec![2]);
    }

    #[test]
    fn concurrent_updates_are_atomic_per_key() {
        let store: Arc<MemoryStore<u8, u64>> = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.update(&0, 0, &mut |slot| {
                            *slot = Some(slot.unwrap_or(0) + 1);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get(&0, 0), Some(8000));
    }
}
