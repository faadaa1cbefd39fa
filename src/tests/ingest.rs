use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::tests::result;
use crate::catalog::{
    BackendCsv, CatalogError, CatalogItem, CatalogItemCreate, CatalogManager,
};
use crate::ingest::IngestionPipeline;
use crate::retry::Backoff;
use crate::fingerprint::{Fingerprint, FingerprintStore};
use crate::ingest::{FailureReason, IngestError, IngestOutcome, ItemStatus};
use crate::storage::StorageManager;

use super::support::*;

#[test]
fn test_ingest_all_fingerprints_items_with_images() {
    let fx = Fixture::new();
    let a = fx.item("a", at_distance(0.1, 1));
    let b = fx.item("b", at_distance(0.2, 2));
    fx.catalog
        .create(CatalogItemCreate {
            title: "no cover yet".to_string(),
            ..Default::default()
        })
        .unwrap();

    let report = fx.pipeline().ingest_all().unwrap();

    assert!(report.is_complete_success());
    assert_eq!(report.count(IngestOutcome::Inserted), 2);
    assert_eq!(fx.store.ids().unwrap(), vec![a, b]);
    assert!(report.pruned.is_empty());
}

#[test]
fn test_reingest_is_idempotent() {
    let fx = Fixture::new();
    fx.item("a", at_distance(0.1, 1));
    fx.item("b", at_distance(0.2, 2));
    let pipeline = fx.pipeline();

    pipeline.ingest_all().unwrap();
    let calls = fx.embedder.calls();
    let search_before = fx.store.search(&Fingerprint::new(query_vector()), 10).unwrap();

    let report = pipeline.ingest_all().unwrap();

    assert_eq!(report.count(IngestOutcome::Unchanged), 2);
    assert_eq!(fx.embedder.calls(), calls);
    assert_eq!(fx.store.len().unwrap(), 2);
    assert_eq!(
        fx.store.search(&Fingerprint::new(query_vector()), 10).unwrap(),
        search_before
    );
}

#[test]
fn test_new_image_replaces_fingerprint_and_invalidates_cache() {
    let fx = Fixture::new();
    let id = fx.item("a", at_distance(0.1, 1));
    let pipeline = fx.pipeline();
    assert_eq!(pipeline.ingest(id).unwrap(), IngestOutcome::Inserted);

    fx.cache
        .put("stale", &result(&[id]), Duration::from_secs(60))
        .unwrap();

    fx.recover(id, at_distance(0.01, 2));
    assert_eq!(pipeline.ingest(id).unwrap(), IngestOutcome::Updated);

    assert_eq!(fx.cache.get("stale").unwrap(), None);
    let nearest = fx.store.search(&Fingerprint::new(query_vector()), 1).unwrap();
    assert!(nearest[0].distance < 0.05);
}

#[test]
fn test_batch_reports_each_item_in_order() {
    let fx = Fixture::new();
    let good = fx.item("good", at_distance(0.1, 1));

    fx.media.write("garbage.png", b"\x00\x01 not an image").unwrap();
    let bad = fx
        .catalog
        .create(CatalogItemCreate {
            title: "bad".to_string(),
            image: Some("garbage.png".to_string()),
            ..Default::default()
        })
        .unwrap()
        .id;
    let bare = fx
        .catalog
        .create(CatalogItemCreate {
            title: "bare".to_string(),
            ..Default::default()
        })
        .unwrap()
        .id;

    let report = fx.pipeline().ingest_batch(&[bad, good, bare, 404]);

    let reasons: Vec<Option<FailureReason>> = report
        .items
        .iter()
        .map(|i| match &i.status {
            ItemStatus::Ok { .. } => None,
            ItemStatus::Failed { reason, .. } => Some(*reason),
        })
        .collect();
    assert_eq!(
        reasons,
        vec![
            Some(FailureReason::InvalidImage),
            None,
            Some(FailureReason::NoImage),
            Some(FailureReason::NotFound),
        ]
    );
    assert_eq!(
        report.items.iter().map(|i| i.item_id).collect::<Vec<_>>(),
        vec![bad, good, bare, 404]
    );
    assert_eq!(report.succeeded(), 1);
    assert!(fx.store.contains(good).unwrap());
    assert!(!fx.store.contains(bad).unwrap());
}

#[test]
fn test_model_unavailable_is_retried() {
    let fx = Fixture::new();
    let id = fx.item("a", at_distance(0.1, 1));

    fx.embedder.fail_times(2);
    assert_eq!(fx.pipeline().ingest(id).unwrap(), IngestOutcome::Inserted);

    let other = fx.item("b", at_distance(0.1, 2));
    fx.embedder.fail_times(10);
    let err = fx.pipeline().ingest(other).unwrap_err();
    assert!(matches!(err, IngestError::ModelUnavailable(_)));
    assert!(!fx.store.contains(other).unwrap());
}

#[test]
fn test_orphan_fingerprints_are_pruned() {
    let fx = Fixture::new();
    let kept = fx.item("a", at_distance(0.1, 1));
    fx.store
        .upsert(99, 1, Fingerprint::new(at_distance(0.0, 1)))
        .unwrap();
    fx.cache
        .put("names-99", &result(&[99]), Duration::from_secs(60))
        .unwrap();

    let report = fx.pipeline().ingest_all().unwrap();

    assert_eq!(report.pruned, vec![99]);
    assert_eq!(fx.store.ids().unwrap(), vec![kept]);
    assert_eq!(fx.cache.get("names-99").unwrap(), None);
}

#[test]
fn test_item_deleted_while_embedding_leaves_no_fingerprint() {
    let fx = Fixture::new();
    let id = fx.item("a", at_distance(0.1, 1));
    fx.embedder.set_delay(Duration::from_millis(200));
    let pipeline = fx.pipeline();

    let result = std::thread::scope(|s| {
        let ingesting = s.spawn(|| pipeline.ingest(id));
        std::thread::sleep(Duration::from_millis(50));
        assert!(fx.catalog.delete(id).unwrap());
        ingesting.join().unwrap()
    });

    assert!(matches!(result, Err(IngestError::NotFound(_))));
    assert!(!fx.store.contains(id).unwrap());
}

/// Catalog that runs a one-shot hook just before an item is held.
struct HookCatalog {
    inner: Arc<BackendCsv>,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CatalogManager for HookCatalog {
    fn get(&self, id: u64) -> Result<Option<CatalogItem>, CatalogError> {
        self.inner.get(id)
    }

    fn list(&self) -> Result<Vec<CatalogItem>, CatalogError> {
        self.inner.list()
    }

    fn create(&self, item: CatalogItemCreate) -> Result<CatalogItem, CatalogError> {
        self.inner.create(item)
    }

    fn set_image(&self, id: u64, image: &str) -> Result<CatalogItem, CatalogError> {
        self.inner.set_image(id, image)
    }

    fn delete(&self, id: u64) -> Result<bool, CatalogError> {
        self.inner.delete(id)
    }

    fn with_item(&self, id: u64, f: &mut dyn FnMut(&CatalogItem)) -> Result<bool, CatalogError> {
        if let Some(hook) = self.hook.lock().unwrap().take() {
            hook();
        }
        self.inner.with_item(id, f)
    }

    fn image_bytes(&self, id: u64) -> Result<Vec<u8>, CatalogError> {
        self.inner.image_bytes(id)
    }
}

#[test]
fn test_delete_finished_before_upsert_is_not_undone() {
    let fx = Fixture::new();
    let id = fx.item("a", at_distance(0.1, 1));
    let hook = {
        let catalog = fx.catalog.clone();
        let store = fx.store.clone();
        move || {
            assert!(catalog.delete(id).unwrap());
            store.remove(id).unwrap();
        }
    };
    let catalog = Arc::new(HookCatalog {
        inner: fx.catalog.clone(),
        hook: Mutex::new(Some(Box::new(hook))),
    });
    let pipeline = IngestionPipeline::new(
        catalog,
        fx.embedder.clone(),
        fx.store.clone(),
        fx.cache.clone(),
        1,
        Backoff::new(1, 0),
    )
    .unwrap();

    let result = pipeline.ingest(id);

    assert!(matches!(result, Err(IngestError::NotFound(_))));
    assert!(!fx.store.contains(id).unwrap());
    assert!(fx.store.search(&Fingerprint::new(at_distance(0.1, 1)), 5).unwrap().is_empty());
}

#[test]
fn test_failed_save_leaves_no_fingerprint() {
    let fx = Fixture::persistent();
    let id = fx.item("a", at_distance(0.1, 1));
    fx.block_store_saves();

    let result = fx.pipeline().ingest(id);

    assert!(matches!(result, Err(IngestError::Store(_))));
    assert!(!fx.store.contains(id).unwrap());
}
