//! Shared fingerprint store used by identification (reads) and ingestion
//! (writes).
//!
//! Mutations happen under the index write lock, so a fingerprint is either
//! fully visible to searches or not at all. Persistence is write-through:
//! after every mutation the index is snapshotted to vectors.bin under a
//! read lock, so searches keep running while the file is written.
//!
//! When a snapshot fails, an upsert is rolled back and reported. A removal
//! stays in effect (a removed item must never be searchable again) and the
//! store is marked dirty, so the next mutation rewrites the file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use crate::fingerprint::embeddings::{model_id_hash, Fingerprint};
use crate::fingerprint::index::{IndexError, Metric, Neighbor, VectorIndex};
use crate::fingerprint::storage::{VectorStorage, VectorStorageError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("fingerprint store unavailable: {0}")]
    Unavailable(String),
}

/// What an upsert did to the stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

pub trait FingerprintStore: Send + Sync {
    fn dimensions(&self) -> usize;

    fn metric(&self) -> Metric;

    fn upsert(
        &self,
        item_id: u64,
        image_hash: u64,
        fingerprint: Fingerprint,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Returns whether a fingerprint was removed.
    fn remove(&self, item_id: u64) -> Result<bool, StoreError>;

    /// The `k` nearest items, ascending by distance, ties by item id.
    fn search(&self, query: &Fingerprint, k: usize) -> Result<Vec<Neighbor>, StoreError>;

    fn contains(&self, item_id: u64) -> Result<bool, StoreError>;

    /// Image hash recorded with an item's fingerprint
    fn image_hash(&self, item_id: u64) -> Result<Option<u64>, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    /// Ids of every fingerprinted item, ascending
    fn ids(&self) -> Result<Vec<u64>, StoreError>;
}

/// In-process store backed by a `VectorIndex` and an optional vectors.bin.
pub struct LocalFingerprintStore {
    index: RwLock<VectorIndex>,
    storage: Option<VectorStorage>,
    model_id: [u8; 32],
    /// Serializes mutations together with their snapshot
    persist_lock: Mutex<()>,
    /// Memory holds changes the file does not
    dirty: AtomicBool,
}

impl LocalFingerprintStore {
    /// Store without persistence.
    pub fn in_memory(model_id: &str, dimensions: usize, metric: Metric) -> Self {
        Self {
            index: RwLock::new(VectorIndex::new(dimensions, metric)),
            storage: None,
            model_id: model_id_hash(model_id),
            persist_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Open (or create) the store at `path`.
    ///
    /// A file written for another model, metric or dimensionality is
    /// discarded and the store starts empty; fingerprints from different
    /// models are never mixed. Corrupt files are an error.
    pub fn open(
        path: PathBuf,
        model_id: &str,
        dimensions: usize,
        metric: Metric,
    ) -> Result<Self, StoreError> {
        let storage = VectorStorage::new(path);
        let model_hash = model_id_hash(model_id);

        let index = if storage.exists() {
            match storage.load(&model_hash, metric, dimensions) {
                Ok(idx) => {
                    log::info!("Loaded {} fingerprints from storage", idx.len());
                    idx
                }
                Err(VectorStorageError::ModelMismatch) => {
                    log::warn!("Model changed to '{model_id}', starting a fresh fingerprint index");
                    VectorIndex::new(dimensions, metric)
                }
                Err(e @ VectorStorageError::MetricMismatch { .. })
                | Err(e @ VectorStorageError::DimensionMismatch { .. }) => {
                    log::warn!("{e}, starting a fresh fingerprint index");
                    VectorIndex::new(dimensions, metric)
                }
                Err(VectorStorageError::VersionMismatch(file_ver, _)) => {
                    log::warn!(
                        "Storage version {} unsupported, starting a fresh fingerprint index",
                        file_ver
                    );
                    VectorIndex::new(dimensions, metric)
                }
                Err(e) => {
                    log::error!("Failed to load fingerprints: {}", e);
                    return Err(e.into());
                }
            }
        } else {
            log::info!("No existing fingerprint index, starting fresh");
            VectorIndex::new(dimensions, metric)
        };

        Ok(Self {
            index: RwLock::new(index),
            storage: Some(storage),
            model_id: model_hash,
            persist_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        })
    }

    fn mutation_guard(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.persist_lock
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("persist lock poisoned: {e}")))
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, VectorIndex>, StoreError> {
        self.index
            .write()
            .map_err(|e| StoreError::Unavailable(format!("index lock poisoned: {e}")))
    }

    /// Snapshot the index to disk. Callers hold the mutation guard.
    fn persist(&self) -> Result<(), StoreError> {
        let Some(storage) = &self.storage else {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(());
        };

        let saved = {
            let index = self
                .index
                .read()
                .map_err(|e| StoreError::Unavailable(format!("index lock poisoned: {e}")))?;
            storage.save(&index, &self.model_id)
        };

        match saved {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to save fingerprints to {}: {e}", storage.path().display());
                Err(e.into())
            }
        }
    }

    /// Whether memory holds a removal that has not reached disk yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn read_index<R>(&self, f: impl FnOnce(&VectorIndex) -> R) -> Result<R, StoreError> {
        let index = self
            .index
            .read()
            .map_err(|e| StoreError::Unavailable(format!("index lock poisoned: {e}")))?;
        Ok(f(&index))
    }
}

impl FingerprintStore for LocalFingerprintStore {
    fn dimensions(&self) -> usize {
        self.read_index(|index| index.dimensions()).unwrap_or_default()
    }

    fn metric(&self) -> Metric {
        self.read_index(|index| index.metric()).unwrap_or_default()
    }

    fn upsert(
        &self,
        item_id: u64,
        image_hash: u64,
        fingerprint: Fingerprint,
    ) -> Result<UpsertOutcome, StoreError> {
        let _guard = self.mutation_guard()?;

        let (outcome, previous) = {
            let mut index = self.write_index()?;

            let outcome = match index.get(item_id) {
                Some(existing)
                    if existing.image_hash == image_hash && existing.fingerprint == fingerprint =>
                {
                    UpsertOutcome::Unchanged
                }
                Some(_) => UpsertOutcome::Replaced,
                None => UpsertOutcome::Inserted,
            };

            let mut previous = None;
            if outcome != UpsertOutcome::Unchanged {
                previous = index.remove(item_id);
                if let Err(e) = index.insert(item_id, image_hash, fingerprint) {
                    if let Some(entry) = previous {
                        index.restore(item_id, entry);
                    }
                    return Err(e.into());
                }
            }
            (outcome, previous)
        };

        if outcome == UpsertOutcome::Unchanged && !self.is_dirty() {
            return Ok(outcome);
        }

        if let Err(e) = self.persist() {
            if outcome != UpsertOutcome::Unchanged {
                let mut index = self.write_index()?;
                index.remove(item_id);
                if let Some(entry) = previous {
                    index.restore(item_id, entry);
                }
                log::warn!("rolled back fingerprint of item={item_id} after failed save");
            }
            return Err(e);
        }

        Ok(outcome)
    }

    fn remove(&self, item_id: u64) -> Result<bool, StoreError> {
        let _guard = self.mutation_guard()?;

        let removed = self.write_index()?.remove(item_id).is_some();
        if removed {
            self.dirty.store(true, Ordering::SeqCst);
        }

        // also retries an earlier removal whose save failed
        if self.is_dirty() {
            self.persist()?;
        }

        Ok(removed)
    }

    fn search(&self, query: &Fingerprint, k: usize) -> Result<Vec<Neighbor>, StoreError> {
        let results = self.read_index(|index| index.search(query.as_slice(), k))??;
        Ok(results)
    }

    fn contains(&self, item_id: u64) -> Result<bool, StoreError> {
        self.read_index(|index| index.contains(item_id))
    }

    fn image_hash(&self, item_id: u64) -> Result<Option<u64>, StoreError> {
        self.read_index(|index| index.get(item_id).map(|e| e.image_hash))
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.read_index(|index| index.len())
    }

    fn ids(&self) -> Result<Vec<u64>, StoreError> {
        let mut ids = self.read_index(|index| index.ids().collect::<Vec<_>>())?;
        ids.sort_unstable();
        Ok(ids)
    }
}
