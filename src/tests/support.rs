//! Test doubles and a tempdir-backed fixture wiring catalog, store and cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::cache::ResultCache;
use crate::catalog::{BackendCsv, CatalogItemCreate, CatalogManager};
use crate::config::MatchingConfig;
use crate::fingerprint::{
    Embedder, EmbeddingError, Fingerprint, FingerprintStore, LocalFingerprintStore, Metric,
    Neighbor, PreprocessError, StoreError, UpsertOutcome,
};
use crate::identify::{IdentifySettings, Identifier};
use crate::ingest::IngestionPipeline;
use crate::matching::MatchPolicy;
use crate::retry::Backoff;
use crate::storage::{BackendLocal, StorageManager};

pub const DIMS: usize = 8;

/// Direction every query in these tests points at.
pub fn query_vector() -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[0] = 1.0;
    v
}

/// Unit vector at cosine distance `distance` from `query_vector()`,
/// leaning towards `axis` so that items at equal distance stay distinct.
pub fn at_distance(distance: f32, axis: usize) -> Vec<f32> {
    assert!((1..DIMS).contains(&axis));
    let cos = 1.0 - distance;
    let mut v = vec![0.0; DIMS];
    v[0] = cos;
    v[axis] = (1.0 - cos * cos).max(0.0).sqrt();
    v
}

/// Embedder that maps known byte strings to fixed vectors.
///
/// Unknown bytes are an invalid image. Counts calls, can be slowed down and
/// can report the model unavailable a number of times.
pub struct ScriptedEmbedder {
    table: Mutex<HashMap<Vec<u8>, Vec<f32>>>,
    calls: AtomicUsize,
    delay_ms: AtomicU32,
    failures: AtomicU32,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            delay_ms: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }

    pub fn learn(&self, image: &[u8], vector: Vec<f32>) {
        self.table.lock().unwrap().insert(image.to_vec(), vector);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    /// The next `n` calls fail with `ModelUnavailable`.
    pub fn fail_times(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl Embedder for ScriptedEmbedder {
    fn model_id(&self) -> &str {
        "scripted-v1"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed(&self, image: &[u8]) -> Result<Fingerprint, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay as u64));
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EmbeddingError::ModelUnavailable("model warming up".to_string()));
        }

        if image.is_empty() {
            return Err(PreprocessError::Empty.into());
        }

        self.table
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .map(Fingerprint::new)
            .ok_or_else(|| PreprocessError::UnsupportedFormat("unknown".to_string()).into())
    }
}

/// Store whose backing index is gone.
pub struct UnavailableStore;

impl UnavailableStore {
    fn err() -> StoreError {
        StoreError::Unavailable("index lock poisoned".to_string())
    }
}

impl FingerprintStore for UnavailableStore {
    fn dimensions(&self) -> usize {
        DIMS
    }

    fn metric(&self) -> Metric {
        Metric::Cosine
    }

    fn upsert(&self, _: u64, _: u64, _: Fingerprint) -> Result<UpsertOutcome, StoreError> {
        Err(Self::err())
    }

    fn remove(&self, _: u64) -> Result<bool, StoreError> {
        Err(Self::err())
    }

    fn search(&self, _: &Fingerprint, _: usize) -> Result<Vec<Neighbor>, StoreError> {
        Err(Self::err())
    }

    fn contains(&self, _: u64) -> Result<bool, StoreError> {
        Err(Self::err())
    }

    fn image_hash(&self, _: u64) -> Result<Option<u64>, StoreError> {
        Err(Self::err())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Err(Self::err())
    }

    fn ids(&self) -> Result<Vec<u64>, StoreError> {
        Err(Self::err())
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub embedder: Arc<ScriptedEmbedder>,
    pub catalog: Arc<BackendCsv>,
    pub media: BackendLocal,
    pub store: Arc<LocalFingerprintStore>,
    pub cache: Arc<ResultCache>,
    queries: AtomicUsize,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Fixture whose store saves to `vectors.bin` in the fixture dir.
    pub fn persistent() -> Self {
        Self::build(true)
    }

    fn build(on_disk: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let media = BackendLocal::new(dir.path().join("media")).unwrap();
        let catalog =
            BackendCsv::load(&dir.path().join("catalog.csv"), Box::new(media.clone())).unwrap();

        let embedder = Arc::new(ScriptedEmbedder::new());
        let store = if on_disk {
            let path = dir.path().join("vectors.bin");
            LocalFingerprintStore::open(path, embedder.model_id(), DIMS, Metric::Cosine).unwrap()
        } else {
            LocalFingerprintStore::in_memory(embedder.model_id(), DIMS, Metric::Cosine)
        };
        let cache = Self::open_cache(&dir);

        Self {
            dir,
            embedder,
            catalog: Arc::new(catalog),
            media,
            store: Arc::new(store),
            cache: Arc::new(cache),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn open_cache(dir: &TempDir) -> ResultCache {
        let storage = BackendLocal::new(dir.path().join("cache")).unwrap();
        ResultCache::open(Box::new(storage), 64, Duration::from_secs(3600)).unwrap()
    }

    /// Catalog item whose cover embeds to `vector`.
    pub fn item(&self, title: &str, vector: Vec<f32>) -> u64 {
        let image = format!("cover:{title}").into_bytes();
        let file = format!("{title}.png");
        self.media.write(&file, &image).unwrap();
        self.embedder.learn(&image, vector);

        self.catalog
            .create(CatalogItemCreate {
                title: title.to_string(),
                image: Some(file),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    /// Point an item at a new cover that embeds to `vector`.
    pub fn recover(&self, id: u64, vector: Vec<f32>) {
        let image = format!("cover:{id}:{}", self.queries.fetch_add(1, Ordering::SeqCst))
            .into_bytes();
        let file = format!("{id}-new.png");
        self.media.write(&file, &image).unwrap();
        self.embedder.learn(&image, vector);
        self.catalog.set_image(id, &file).unwrap();
    }

    /// Fresh query photo bytes that embed to `vector`.
    pub fn photo(&self, vector: Vec<f32>) -> Vec<u8> {
        let n = self.queries.fetch_add(1, Ordering::SeqCst);
        let image = format!("photo:{n}").into_bytes();
        self.embedder.learn(&image, vector);
        image
    }

    pub fn settings(&self) -> IdentifySettings {
        IdentifySettings {
            timeout: Duration::from_secs(5),
            retry: Backoff::new(2, 0),
            search_k: 10,
            cache_ttl: Duration::from_secs(3600),
        }
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier_with(self.settings())
    }

    pub fn identifier_with(&self, settings: IdentifySettings) -> Identifier {
        Identifier::new(
            self.embedder.clone(),
            self.store.clone(),
            self.cache.clone(),
            MatchPolicy::from_config(&MatchingConfig::default()),
            settings,
        )
    }

    pub fn pipeline(&self) -> IngestionPipeline {
        IngestionPipeline::new(
            self.catalog.clone(),
            self.embedder.clone(),
            self.store.clone(),
            self.cache.clone(),
            4,
            Backoff::new(3, 0),
        )
        .unwrap()
    }

    /// Items created and fingerprinted.
    pub fn ingested(&self, items: &[(&str, Vec<f32>)]) -> Vec<u64> {
        let ids: Vec<u64> = items
            .iter()
            .map(|(title, vector)| self.item(title, vector.clone()))
            .collect();
        let report = self.pipeline().ingest_batch(&ids);
        assert!(report.is_complete_success(), "{report:?}");
        ids
    }

    /// Makes every later save of the fingerprint file fail.
    pub fn block_store_saves(&self) -> std::path::PathBuf {
        let blocker = self.dir.path().join("vectors.tmp");
        std::fs::create_dir(&blocker).unwrap();
        blocker
    }

    /// Catalog delete followed by the store and cache cleanup.
    pub fn delete(&self, identifier: &Identifier, id: u64) {
        assert!(self.catalog.delete(id).unwrap());
        identifier.forget_item(id).unwrap();
    }
}
