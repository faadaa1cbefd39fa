//! Fingerprint ingestion for catalog items.
//!
//! `ingest` reads an item's current image, embeds it and upserts the
//! fingerprint store. Batches run on a bounded rayon pool and always
//! produce a per-item report; one bad image never stops the rest.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::cache::ResultCache;
use crate::catalog::{CatalogError, CatalogItem, CatalogManager};
use crate::config::Config;
use crate::fingerprint::{image_hash, Embedder, EmbeddingError, FingerprintStore, UpsertOutcome};
use crate::retry::Backoff;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("item {0} not found in catalog")]
    NotFound(u64),

    #[error("item {0} has no image")]
    NoImage(u64),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("fingerprint store error: {0}")]
    Store(String),

    #[error("cache error: {0}")]
    Cache(String),
}

impl From<CatalogError> for IngestError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => IngestError::NotFound(id),
            CatalogError::NoImage(id) => IngestError::NoImage(id),
            e => IngestError::Catalog(e.to_string()),
        }
    }
}

impl From<EmbeddingError> for IngestError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::InvalidImage(e) => IngestError::InvalidImage(e.to_string()),
            EmbeddingError::ModelUnavailable(msg) => IngestError::ModelUnavailable(msg),
            e @ EmbeddingError::InvalidModel(_) => IngestError::ModelUnavailable(e.to_string()),
        }
    }
}

impl IngestError {
    pub fn reason(&self) -> FailureReason {
        match self {
            IngestError::NotFound(_) => FailureReason::NotFound,
            IngestError::NoImage(_) => FailureReason::NoImage,
            IngestError::InvalidImage(_) => FailureReason::InvalidImage,
            IngestError::ModelUnavailable(_) => FailureReason::ModelUnavailable,
            IngestError::Catalog(_) | IngestError::Store(_) | IngestError::Cache(_) => {
                FailureReason::Storage
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotFound,
    NoImage,
    InvalidImage,
    ModelUnavailable,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// First fingerprint for the item
    Inserted,
    /// Image changed, fingerprint replaced
    Updated,
    /// Image unchanged since the stored fingerprint
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Ok { outcome: IngestOutcome },
    Failed { reason: FailureReason, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub item_id: u64,
    #[serde(flatten)]
    pub status: ItemStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub items: Vec<ItemReport>,
    /// Fingerprints removed because their item left the catalog
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<u64>,
}

impl IngestReport {
    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.status, ItemStatus::Ok { .. }))
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| matches!(i.status, ItemStatus::Failed { .. }))
    }

    pub fn count(&self, outcome: IngestOutcome) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Ok { outcome })
            .count()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

pub struct IngestionPipeline {
    catalog: Arc<dyn CatalogManager>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn FingerprintStore>,
    cache: Arc<ResultCache>,
    pool: rayon::ThreadPool,
    retry: Backoff,
}

impl IngestionPipeline {
    pub fn new(
        catalog: Arc<dyn CatalogManager>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn FingerprintStore>,
        cache: Arc<ResultCache>,
        parallelism: usize,
        retry: Backoff,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism.max(1))
            .thread_name(|i| format!("ingest-{i}"))
            .build()?;

        Ok(Self {
            catalog,
            embedder,
            store,
            cache,
            pool,
            retry,
        })
    }

    pub fn from_config(
        config: &Config,
        catalog: Arc<dyn CatalogManager>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn FingerprintStore>,
        cache: Arc<ResultCache>,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        Self::new(
            catalog,
            embedder,
            store,
            cache,
            config.ingest.parallelism,
            Backoff::new(config.ingest.max_retries, config.ingest.retry_base_delay_ms),
        )
    }

    /// (Re)compute the fingerprint of one item from its current image.
    pub fn ingest(&self, item_id: u64) -> Result<IngestOutcome, IngestError> {
        let image = self.catalog.image_bytes(item_id)?;
        let hash = image_hash(&image);

        let stored_hash = self
            .store
            .image_hash(item_id)
            .map_err(|e| IngestError::Store(e.to_string()))?;
        if stored_hash == Some(hash) {
            return Ok(IngestOutcome::Unchanged);
        }

        let fingerprint = self.retry.run_blocking(
            &format!("ingest item={item_id}"),
            || self.embedder.embed(&image).map_err(IngestError::from),
            |e| matches!(e, IngestError::ModelUnavailable(_)),
        )?;

        // the item may have been deleted while its image was embedded; holding
        // it in the catalog keeps a deletion from landing before the upsert
        let mut fingerprint = Some(fingerprint);
        let mut upserted = None;
        let present = self.catalog.with_item(item_id, &mut |_: &CatalogItem| {
            if let Some(fingerprint) = fingerprint.take() {
                upserted = Some(self.store.upsert(item_id, hash, fingerprint));
            }
        })?;
        let upserted = match upserted {
            Some(result) if present => result.map_err(|e| IngestError::Store(e.to_string()))?,
            _ => return Err(IngestError::NotFound(item_id)),
        };

        let outcome = match upserted {
            UpsertOutcome::Inserted => IngestOutcome::Inserted,
            UpsertOutcome::Replaced => {
                self.cache
                    .invalidate(item_id)
                    .map_err(|e| IngestError::Cache(e.to_string()))?;
                IngestOutcome::Updated
            }
            UpsertOutcome::Unchanged => IngestOutcome::Unchanged,
        };

        Ok(outcome)
    }

    /// Ingest many items in parallel. The report keeps the input order.
    pub fn ingest_batch(&self, item_ids: &[u64]) -> IngestReport {
        let started = Instant::now();

        let items: Vec<ItemReport> = self.pool.install(|| {
            item_ids
                .par_iter()
                .map(|&item_id| {
                    let status = match self.ingest(item_id) {
                        Ok(outcome) => {
                            log::info!("ingest item={item_id} outcome={outcome:?}");
                            ItemStatus::Ok { outcome }
                        }
                        Err(e) => {
                            log::warn!("ingest item={item_id} outcome=failed error={e}");
                            ItemStatus::Failed {
                                reason: e.reason(),
                                message: e.to_string(),
                            }
                        }
                    };
                    ItemReport { item_id, status }
                })
                .collect()
        });

        let report = IngestReport {
            items,
            pruned: vec![],
        };
        log::info!(
            "ingested {} items: {} ok, {} failed in {}ms",
            report.items.len(),
            report.succeeded(),
            report.failed().count(),
            started.elapsed().as_millis()
        );

        report
    }

    /// Ingest every catalog item with an image and drop fingerprints of
    /// items no longer in the catalog.
    pub fn ingest_all(&self) -> Result<IngestReport, IngestError> {
        let ids: Vec<u64> = self
            .catalog
            .list()?
            .iter()
            .filter(|item| item.image.is_some())
            .map(|item| item.id)
            .collect();

        let mut report = self.ingest_batch(&ids);
        report.pruned = self.prune_orphans()?;

        Ok(report)
    }

    /// Drop fingerprints and cached results of items that are no longer in
    /// the catalog, e.g. after a removal whose save failed before a restart.
    /// Returns the ids whose fingerprints were dropped.
    pub fn prune_orphans(&self) -> Result<Vec<u64>, IngestError> {
        let known: HashSet<u64> = self.catalog.list()?.iter().map(|i| i.id).collect();

        let stored = self
            .store
            .ids()
            .map_err(|e| IngestError::Store(e.to_string()))?;
        let mut pruned = vec![];
        for item_id in stored.into_iter().filter(|id| !known.contains(id)) {
            self.forget(item_id)?;
            log::info!("pruned fingerprint of removed item={item_id}");
            pruned.push(item_id);
        }

        let cached = self
            .cache
            .item_ids()
            .map_err(|e| IngestError::Cache(e.to_string()))?;
        for item_id in cached.into_iter().filter(|id| !known.contains(id)) {
            self.cache
                .invalidate(item_id)
                .map_err(|e| IngestError::Cache(e.to_string()))?;
        }

        Ok(pruned)
    }

    /// Cache invalidation runs even when the store fails to save the removal.
    fn forget(&self, item_id: u64) -> Result<(), IngestError> {
        let removed = self.store.remove(item_id);
        self.cache
            .invalidate(item_id)
            .map_err(|e| IngestError::Cache(e.to_string()))?;
        removed.map_err(|e| IngestError::Store(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_errors_map_to_reasons() {
        assert_eq!(
            IngestError::from(CatalogError::NotFound(3)).reason(),
            FailureReason::NotFound
        );
        assert_eq!(
            IngestError::from(CatalogError::NoImage(3)).reason(),
            FailureReason::NoImage
        );
        assert_eq!(
            IngestError::from(CatalogError::Malformed("x".to_string())).reason(),
            FailureReason::Storage
        );
    }

    #[test]
    fn test_report_counts() {
        let report = IngestReport {
            items: vec![
                ItemReport {
                    item_id: 1,
                    status: ItemStatus::Ok {
                        outcome: IngestOutcome::Inserted,
                    },
                },
                ItemReport {
                    item_id: 2,
                    status: ItemStatus::Ok {
                        outcome: IngestOutcome::Unchanged,
                    },
                },
                ItemReport {
                    item_id: 3,
                    status: ItemStatus::Failed {
                        reason: FailureReason::InvalidImage,
                        message: "bad".to_string(),
                    },
                },
            ],
            pruned: vec![],
        };

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.count(IngestOutcome::Inserted), 1);
        assert!(!report.is_complete_success());
    }

    #[test]
    fn test_report_json_shape() {
        let report = IngestReport {
            items: vec![
                ItemReport {
                    item_id: 1,
                    status: ItemStatus::Ok {
                        outcome: IngestOutcome::Updated,
                    },
                },
                ItemReport {
                    item_id: 2,
                    status: ItemStatus::Failed {
                        reason: FailureReason::NoImage,
                        message: "item 2 has no image".to_string(),
                    },
                },
            ],
            pruned: vec![],
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "items": [
                    {"item_id": 1, "status": "ok", "outcome": "updated"},
                    {"item_id": 2, "status": "failed", "reason": "no_image", "message": "item 2 has no image"},
                ]
            })
        );
    }
}
