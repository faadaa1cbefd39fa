//! Two-tier cache of match results keyed by query digest.
//!
//! Lookups check the volatile tier, then the durable tier (repopulating the
//! volatile tier on a hit). Every entry is indexed by the catalog items its
//! result references so that deleting an item drops all entries pointing at
//! it.
//!
//! Invalidation bumps an epoch. A result computed under an older epoch is
//! never published, so a computation that overlapped a deletion cannot
//! resurrect the deleted item in the cache.
//!
//! The state lock only guards the volatile tier and the indexes. Durable
//! records are read, written and deleted outside it, so a slow disk never
//! holds up lookups of other keys. A key is indexed only after its record
//! is written and is unindexed before its record is deleted.

mod durable;
mod volatile;

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::matching::MatchResult;
use crate::storage::StorageManager;

pub use durable::DurableTier;
pub use volatile::VolatileTier;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub result: MatchResult,
    /// Unix millis
    pub created_at: i64,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        let ttl_ms = i64::try_from(self.ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_ms >= self.created_at.saturating_add(ttl_ms)
    }
}

/// Which tier served a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Volatile,
    Durable,
}

struct CacheState {
    volatile: VolatileTier,
    /// item id -> keys whose result references it
    by_item: HashMap<u64, HashSet<String>>,
    /// key -> referenced item ids, for every key in either tier
    items_of: HashMap<String, Vec<u64>>,
    epoch: u64,
}

impl CacheState {
    fn index(&mut self, entry: &CacheEntry) {
        self.unindex(&entry.key);

        let items: Vec<u64> = entry.result.item_ids().collect();
        for item_id in &items {
            self.by_item
                .entry(*item_id)
                .or_default()
                .insert(entry.key.clone());
        }
        self.items_of.insert(entry.key.clone(), items);
    }

    fn unindex(&mut self, key: &str) {
        let Some(items) = self.items_of.remove(key) else {
            return;
        };
        for item_id in items {
            if let Some(keys) = self.by_item.get_mut(&item_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_item.remove(&item_id);
                }
            }
        }
    }
}

pub struct ResultCache {
    state: Mutex<CacheState>,
    durable: DurableTier,
    default_ttl: Duration,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn check_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

impl ResultCache {
    /// Open the cache over `storage`, indexing surviving durable records.
    /// Expired records are removed.
    pub fn open(
        storage: Box<dyn StorageManager>,
        volatile_capacity: usize,
        default_ttl: Duration,
    ) -> Result<Self, CacheError> {
        let durable = DurableTier::new(storage);
        let mut state = CacheState {
            volatile: VolatileTier::new(volatile_capacity),
            by_item: HashMap::new(),
            items_of: HashMap::new(),
            epoch: 0,
        };

        let now = now_ms();
        let mut expired = 0;
        for entry in durable.entries() {
            if entry.is_expired(now) {
                durable.remove(&entry.key)?;
                expired += 1;
            } else {
                state.index(&entry);
            }
        }

        log::info!(
            "Result cache opened: {} durable entries, {} expired removed",
            state.items_of.len(),
            expired
        );

        Ok(Self {
            state: Mutex::new(state),
            durable,
            default_ttl,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("cache lock poisoned: {e}")))
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Current invalidation epoch; pass it to `put_if_current`.
    pub fn epoch(&self) -> Result<u64, CacheError> {
        Ok(self.lock()?.epoch)
    }

    /// Number of keys held in either tier
    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.lock()?.items_of.len())
    }

    /// Every item referenced by a cached result, ascending.
    pub fn item_ids(&self) -> Result<Vec<u64>, CacheError> {
        let mut ids: Vec<u64> = self.lock()?.by_item.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn get(&self, key: &str) -> Result<Option<MatchResult>, CacheError> {
        Ok(self.lookup(key)?.map(|(result, _)| result))
    }

    /// Like `get`, also reporting the tier that answered.
    pub fn lookup(&self, key: &str) -> Result<Option<(MatchResult, CacheTier)>, CacheError> {
        check_key(key)?;
        let now = now_ms();

        let epoch = {
            let mut state = self.lock()?;
            let cached = state
                .volatile
                .get(key)
                .map(|entry| (entry.is_expired(now), entry.result.clone()));
            match cached {
                Some((false, result)) => return Ok(Some((result, CacheTier::Volatile))),
                Some((true, _)) => {
                    state.volatile.remove(key);
                    state.unindex(key);
                    drop(state);
                    self.durable.remove(key)?;
                    return Ok(None);
                }
                None => {}
            }
            if !state.items_of.contains_key(key) {
                return Ok(None);
            }
            state.epoch
        };

        let Some(entry) = self.durable.get(key)? else {
            self.lock()?.unindex(key);
            return Ok(None);
        };

        let mut state = self.lock()?;
        if state.epoch != epoch {
            // an invalidation ran while the record was read
            return Ok(None);
        }

        if entry.is_expired(now) {
            state.unindex(key);
            drop(state);
            self.durable.remove(key)?;
            return Ok(None);
        }

        let result = entry.result.clone();
        for evicted in state.volatile.insert(entry, now) {
            log::debug!("volatile cache evicted key={}", short_key(&evicted));
        }

        Ok(Some((result, CacheTier::Durable)))
    }

    /// Store a result in both tiers.
    pub fn put(&self, key: &str, result: &MatchResult, ttl: Duration) -> Result<(), CacheError> {
        let epoch = self.epoch()?;
        self.put_if_current(key, result, ttl, epoch)?;
        Ok(())
    }

    /// Store a result unless an invalidation happened after `epoch` was
    /// read. Returns whether the entry was published.
    pub fn put_if_current(
        &self,
        key: &str,
        result: &MatchResult,
        ttl: Duration,
        epoch: u64,
    ) -> Result<bool, CacheError> {
        check_key(key)?;
        let now = now_ms();
        let entry = CacheEntry {
            key: key.to_string(),
            result: result.clone(),
            created_at: now,
            ttl_secs: ttl.as_secs(),
        };

        if self.lock()?.epoch != epoch {
            log::debug!(
                "not caching key={}: invalidated during computation",
                short_key(key)
            );
            return Ok(false);
        }

        self.durable.put(&entry)?;

        let mut state = self.lock()?;
        if state.epoch != epoch {
            // an invalidation ran while the record was written
            drop(state);
            log::debug!(
                "not caching key={}: invalidated during computation",
                short_key(key)
            );
            self.durable.remove(key)?;
            return Ok(false);
        }

        state.index(&entry);
        for evicted in state.volatile.insert(entry, now) {
            log::debug!("volatile cache evicted key={}", short_key(&evicted));
        }

        Ok(true)
    }

    /// Drop every entry whose result references `item_id`. Returns the
    /// number of entries dropped.
    pub fn invalidate(&self, item_id: u64) -> Result<usize, CacheError> {
        let (keys, epoch) = {
            let mut state = self.lock()?;
            state.epoch += 1;

            let keys: Vec<String> = state
                .by_item
                .get(&item_id)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default();
            for key in &keys {
                state.volatile.remove(key);
                state.unindex(key);
            }
            (keys, state.epoch)
        };

        self.remove_records(&keys)?;

        log::info!(
            "cache invalidated item={item_id} entries={} epoch={epoch}",
            keys.len()
        );

        Ok(keys.len())
    }

    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        check_key(key)?;
        {
            let mut state = self.lock()?;
            state.volatile.remove(key);
            state.unindex(key);
        }
        self.durable.remove(key)
    }

    /// Remove expired entries from both tiers. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = now_ms();
        let expired: Vec<String> = self
            .durable
            .entries()
            .into_iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key)
            .collect();

        {
            let mut state = self.lock()?;
            for key in &expired {
                state.volatile.remove(key);
                state.unindex(key);
            }
        }
        self.remove_records(&expired)?;

        Ok(expired.len())
    }

    /// Drop everything, e.g. after the embedding model changed.
    pub fn clear(&self) -> Result<(), CacheError> {
        let keys: Vec<String> = {
            let mut state = self.lock()?;
            state.epoch += 1;
            let keys = state.items_of.keys().cloned().collect();
            state.volatile.clear();
            state.by_item.clear();
            state.items_of.clear();
            keys
        };

        self.remove_records(&keys)
    }

    fn remove_records(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.durable.remove(key)?;
        }
        Ok(())
    }
}

/// Abbreviated key for log lines
pub fn short_key(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::matching::{Candidate, Decision, Thresholds};
    use crate::storage::BackendLocal;
    use std::sync::mpsc;

    pub fn result(items: &[u64]) -> MatchResult {
        MatchResult {
            decision: match items.len() {
                0 => Decision::None,
                1 => Decision::Definite,
                _ => Decision::Ambiguous,
            },
            candidates: items
                .iter()
                .enumerate()
                .map(|(i, &item_id)| Candidate {
                    item_id,
                    distance: 0.05 * (i as f32 + 1.0),
                })
                .collect(),
            thresholds: Thresholds {
                high: 0.08,
                low: 0.25,
                ambiguous_set_size: 3,
                weak_suggestions: false,
            },
        }
    }

    pub fn entry(key: &str, created_at: i64, ttl_secs: u64, items: &[u64]) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            result: result(items),
            created_at,
            ttl_secs,
        }
    }

    fn open(dir: &std::path::Path, capacity: usize) -> ResultCache {
        let storage = BackendLocal::new(dir).unwrap();
        ResultCache::open(Box::new(storage), capacity, Duration::from_secs(3600)).unwrap()
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_entry_expiry() {
        let e = entry("k", 1_000, 2, &[]);
        assert!(!e.is_expired(1_000));
        assert!(!e.is_expired(2_999));
        assert!(e.is_expired(3_000));
        assert!(entry("k", 1_000, 0, &[]).is_expired(1_000));
    }

    #[test]
    fn test_put_then_get_from_volatile() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);

        cache.put("aa11", &result(&[1]), HOUR).unwrap();
        let (hit, tier) = cache.lookup("aa11").unwrap().unwrap();
        assert_eq!(hit, result(&[1]));
        assert_eq!(tier, CacheTier::Volatile);
        assert!(cache.get("bb22").unwrap().is_none());
    }

    #[test]
    fn test_durable_tier_survives_reopen_and_repopulates() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = open(dir.path(), 8);
            cache.put("aa11", &result(&[1, 2]), HOUR).unwrap();
        }

        let cache = open(dir.path(), 8);
        assert_eq!(cache.len().unwrap(), 1);

        let (_, tier) = cache.lookup("aa11").unwrap().unwrap();
        assert_eq!(tier, CacheTier::Durable);
        let (_, tier) = cache.lookup("aa11").unwrap().unwrap();
        assert_eq!(tier, CacheTier::Volatile);
    }

    #[test]
    fn test_volatile_eviction_falls_back_to_durable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1);

        cache.put("k1", &result(&[1]), HOUR).unwrap();
        cache.put("k2", &result(&[2]), HOUR).unwrap();

        let (hit, tier) = cache.lookup("k1").unwrap().unwrap();
        assert_eq!(hit, result(&[1]));
        assert_eq!(tier, CacheTier::Durable);
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);

        cache.put("k1", &result(&[1]), Duration::ZERO).unwrap();
        assert!(cache.get("k1").unwrap().is_none());
        assert!(!dir.path().join("k1.json").exists());
        assert_eq!(cache.len().unwrap(), 0);
    }

    #[test]
    fn test_open_drops_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(dir.path()).unwrap();
        DurableTier::new(Box::new(storage.clone()))
            .put(&entry("old", 0, 1, &[1]))
            .unwrap();

        let cache = open(dir.path(), 8);
        assert_eq!(cache.len().unwrap(), 0);
        assert!(!storage.exists("old.json"));
    }

    #[test]
    fn test_invalidate_drops_only_referencing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);

        cache.put("k1", &result(&[1]), HOUR).unwrap();
        cache.put("k2", &result(&[2, 1, 3]), HOUR).unwrap();
        cache.put("k3", &result(&[3]), HOUR).unwrap();

        assert_eq!(cache.invalidate(1).unwrap(), 2);
        assert!(cache.get("k1").unwrap().is_none());
        assert!(cache.get("k2").unwrap().is_none());
        assert!(cache.get("k3").unwrap().is_some());

        // durable records are gone too
        let reopened = open(dir.path(), 8);
        assert!(reopened.get("k2").unwrap().is_none());
        assert!(reopened.get("k3").unwrap().is_some());
    }

    #[test]
    fn test_invalidate_unknown_item_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);
        cache.put("k1", &result(&[1]), HOUR).unwrap();

        assert_eq!(cache.invalidate(42).unwrap(), 0);
        assert!(cache.get("k1").unwrap().is_some());
    }

    #[test]
    fn test_stale_epoch_is_not_published() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);

        let epoch = cache.epoch().unwrap();
        cache.invalidate(7).unwrap();

        let published = cache
            .put_if_current("k1", &result(&[7]), HOUR, epoch)
            .unwrap();
        assert!(!published);
        assert!(cache.get("k1").unwrap().is_none());

        let epoch = cache.epoch().unwrap();
        assert!(cache.put_if_current("k1", &result(&[7]), HOUR, epoch).unwrap());
    }

    #[test]
    fn test_replacing_entry_reindexes_items() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);

        cache.put("k1", &result(&[1]), HOUR).unwrap();
        cache.put("k1", &result(&[2]), HOUR).unwrap();

        assert_eq!(cache.invalidate(1).unwrap(), 0);
        assert_eq!(cache.invalidate(2).unwrap(), 1);
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);

        assert!(matches!(
            cache.put("../escape", &result(&[]), HOUR),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(cache.get(""), Err(CacheError::InvalidKey(_))));
    }

    /// Storage whose write of one ident waits until the test releases it.
    struct GatedStorage {
        inner: BackendLocal,
        gated: &'static str,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl StorageManager for GatedStorage {
        fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
            if ident == self.gated {
                self.entered.lock().unwrap().send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            self.inner.write(ident, data)
        }

        fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
            self.inner.read(ident)
        }

        fn exists(&self, ident: &str) -> bool {
            self.inner.exists(ident)
        }

        fn delete(&self, ident: &str) -> std::io::Result<()> {
            self.inner.delete(ident)
        }

        fn list(&self) -> Vec<String> {
            self.inner.list()
        }
    }

    #[test]
    fn test_slow_durable_write_does_not_block_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let storage = GatedStorage {
            inner: BackendLocal::new(dir.path()).unwrap(),
            gated: "slow.json",
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let cache = ResultCache::open(Box::new(storage), 8, HOUR).unwrap();
        cache.put("fast", &result(&[1]), HOUR).unwrap();
        let cache = &cache;

        std::thread::scope(|s| {
            let writer = s.spawn(|| cache.put("slow", &result(&[2]), HOUR));
            entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

            let (done_tx, done_rx) = mpsc::channel();
            s.spawn(move || {
                let hit = cache.lookup("fast").unwrap();
                let len = cache.len().unwrap();
                done_tx.send((hit, len)).unwrap();
            });
            let answered = done_rx.recv_timeout(Duration::from_secs(5));

            release_tx.send(()).unwrap();
            writer.join().unwrap().unwrap();

            let (hit, len) = answered.expect("lookup waited on the durable write");
            assert_eq!(hit, Some((result(&[1]), CacheTier::Volatile)));
            assert_eq!(len, 1);
        });

        assert_eq!(cache.get("slow").unwrap(), Some(result(&[2])));
    }

    #[test]
    fn test_item_ids_lists_referenced_items() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);
        cache.put("k1", &result(&[4, 2]), HOUR).unwrap();
        cache.put("k2", &result(&[2]), HOUR).unwrap();

        assert_eq!(cache.item_ids().unwrap(), vec![2, 4]);
        cache.invalidate(2).unwrap();
        assert!(cache.item_ids().unwrap().is_empty());
    }

    #[test]
    fn test_clear_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 8);

        cache.put("live", &result(&[1]), HOUR).unwrap();
        cache.put("dead", &result(&[2]), Duration::ZERO).unwrap();
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.len().unwrap(), 1);

        cache.clear().unwrap();
        assert_eq!(cache.len().unwrap(), 0);
        assert!(cache.get("live").unwrap().is_none());
    }
}
