use std::collections::HashMap;

use super::CacheEntry;

/// Bounded in-memory tier. When full, expired entries go first, then the
/// oldest entry by creation time.
pub struct VolatileTier {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
}

impl VolatileTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert an entry, returning keys evicted to make room.
    pub fn insert(&mut self, entry: CacheEntry, now_ms: i64) -> Vec<String> {
        let mut evicted = vec![];

        if !self.entries.contains_key(&entry.key) && self.entries.len() >= self.capacity {
            self.entries.retain(|key, e| {
                let keep = !e.is_expired(now_ms);
                if !keep {
                    evicted.push(key.clone());
                }
                keep
            });

            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .values()
                    .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)))
                    .map(|e| e.key.clone());
                if let Some(key) = oldest {
                    self.entries.remove(&key);
                    evicted.push(key);
                }
            }
        }

        self.entries.insert(entry.key.clone(), entry);
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
