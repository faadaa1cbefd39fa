use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::{
    cache::ResultCache,
    catalog::{CatalogItem, CatalogItemCreate, CatalogManager},
    config::Config,
    fingerprint::{preprocess, Embedder, FingerprintStore},
    identify::{IdentifySettings, Identifier},
    import::{ImportFile, ImportReport, ImportRow, RowReport, RowStatus},
    ingest::{IngestReport, IngestionPipeline, ItemReport},
    matching::{MatchPolicy, MatchResult},
    metadata::{compare, CollectedMetadata, Comparison, MetadataOrchestrator},
    storage::StorageManager,
};

use super::errors::AppError;

/// Everything a command or request handler needs, wired once.
pub struct App {
    config: Config,
    catalog: Arc<dyn CatalogManager>,
    media: Arc<dyn StorageManager>,
    cache: Arc<ResultCache>,
    identifier: Identifier,
    pipeline: IngestionPipeline,
    metadata: MetadataOrchestrator,
}

pub struct AppParts {
    pub catalog: Arc<dyn CatalogManager>,
    pub media: Arc<dyn StorageManager>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn FingerprintStore>,
    pub cache: Arc<ResultCache>,
    pub metadata: MetadataOrchestrator,
}

impl App {
    pub fn new(config: Config, parts: AppParts) -> Result<Self, AppError> {
        let identifier = Identifier::new(
            parts.embedder.clone(),
            parts.store.clone(),
            parts.cache.clone(),
            MatchPolicy::from_config(&config.matching),
            IdentifySettings::from(&config),
        );

        let pipeline = IngestionPipeline::from_config(
            &config,
            parts.catalog.clone(),
            parts.embedder,
            parts.store,
            parts.cache.clone(),
        )?;

        // fingerprints of items deleted while a save was failing
        match pipeline.prune_orphans() {
            Ok(pruned) if !pruned.is_empty() => {
                log::warn!("pruned {} fingerprints of deleted items", pruned.len())
            }
            Ok(_) => {}
            Err(e) => log::warn!("failed to prune orphaned fingerprints: {e}"),
        }

        Ok(Self {
            config,
            catalog: parts.catalog,
            media: parts.media,
            cache: parts.cache,
            identifier,
            pipeline,
            metadata: parts.metadata,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn catalog(&self) -> &dyn CatalogManager {
        self.catalog.as_ref()
    }

    pub async fn identify(&self, image: Vec<u8>) -> Result<MatchResult, AppError> {
        Ok(self.identifier.identify(image).await?)
    }

    /// Blocking; runs on the ingestion pool.
    pub fn ingest(&self, item_ids: &[u64]) -> IngestReport {
        self.pipeline.ingest_batch(item_ids)
    }

    /// Blocking; runs on the ingestion pool.
    pub fn ingest_all(&self) -> Result<IngestReport, AppError> {
        Ok(self.pipeline.ingest_all()?)
    }

    /// Store the image, create the catalog item and fingerprint it.
    ///
    /// The item is kept even when fingerprinting fails; the report says why.
    pub fn add_item(
        &self,
        title: String,
        parent_id: Option<u64>,
        image: &[u8],
    ) -> Result<(CatalogItem, ItemReport), AppError> {
        let item = self.create_item(title, parent_id, image)?;
        let report = self.ingest_one(item.id);
        Ok((item, report))
    }

    /// Create an artist item and a release item per CSV row, then
    /// fingerprint every created release in one batch.
    ///
    /// Rows naming a release the artist already has are left alone. Rows
    /// with a blank column or an unreadable cover are skipped and reported.
    pub fn import_csv(&self, path: &Path) -> Result<ImportReport, AppError> {
        let file = ImportFile::read(path)?;

        let mut artists: HashMap<String, u64> = HashMap::new();
        let mut releases: HashMap<(u64, String), u64> = HashMap::new();
        for item in self.catalog.list()? {
            match item.parent_id {
                Some(parent) => {
                    releases.insert((parent, item.title), item.id);
                }
                None if item.image.is_none() => {
                    artists.entry(item.title).or_insert(item.id);
                }
                None => {}
            }
        }

        let mut rows = Vec::with_capacity(file.rows.len());
        for (line, row) in &file.rows {
            let status = match row.missing_column() {
                Some(column) => RowStatus::Skipped {
                    message: format!("{column} is empty"),
                },
                None => self.import_row(&file, row, &mut artists, &mut releases)?,
            };
            if let RowStatus::Skipped { message } = &status {
                log::warn!("import line={line} skipped: {message}");
            }
            rows.push(RowReport {
                line: *line,
                artist: row.artist.clone(),
                release: row.release.clone(),
                status,
            });
        }

        let mut report = ImportReport {
            rows,
            ingest: IngestReport::default(),
        };
        let created: Vec<u64> = report.created().collect();
        log::info!(
            "imported {} of {} rows from {}",
            created.len(),
            report.rows.len(),
            path.display()
        );

        report.ingest = self.pipeline.ingest_batch(&created);
        Ok(report)
    }

    /// Point an item at a new image and refresh its fingerprint.
    pub fn replace_image(&self, id: u64, image: &[u8]) -> Result<(CatalogItem, ItemReport), AppError> {
        let previous = self.catalog.get(id)?.ok_or(AppError::NotFound(id))?;
        let file_name = self.save_image(image)?;

        let item = match self.catalog.set_image(id, &file_name) {
            Ok(item) => item,
            Err(e) => {
                self.delete_media(&file_name);
                return Err(e.into());
            }
        };

        if let Some(old) = previous.image.filter(|old| *old != file_name) {
            self.delete_media(&old);
        }

        let report = self.ingest_one(id);
        Ok((item, report))
    }

    /// Delete an item from the catalog, then its fingerprint and every
    /// cached result naming it. Returns whether the item existed.
    ///
    /// The fingerprint and cache cleanup also runs for an id the catalog no
    /// longer has, so repeating a removal that failed half way finishes it.
    pub fn remove_item(&self, id: u64) -> Result<bool, AppError> {
        let item = self.catalog.get(id)?;
        let existed = match item {
            Some(_) => self.catalog.delete(id)?,
            None => false,
        };

        if let Some(image) = item.and_then(|item| item.image).filter(|_| existed) {
            self.delete_media(&image);
        }

        self.identifier.forget_item(id)?;

        if existed {
            log::info!("removed item={id}");
        }
        Ok(existed)
    }

    /// Blocking; queries the providers over HTTP.
    pub fn metadata(
        &self,
        query: &str,
        sources: Option<&[String]>,
    ) -> Result<(CollectedMetadata, Comparison), AppError> {
        let collected = self.metadata.collect(query, sources)?;
        let comparison = compare(&collected);
        Ok((collected, comparison))
    }

    pub fn metadata_sources(&self) -> Vec<&'static str> {
        self.metadata.sources()
    }

    /// Drop expired cache entries, or every entry with `all`.
    pub fn purge_cache(&self, all: bool) -> Result<usize, AppError> {
        if all {
            let count = self.cache.len()?;
            self.cache.clear()?;
            return Ok(count);
        }
        Ok(self.cache.purge_expired()?)
    }

    fn import_row(
        &self,
        file: &ImportFile,
        row: &ImportRow,
        artists: &mut HashMap<String, u64>,
        releases: &mut HashMap<(u64, String), u64>,
    ) -> Result<RowStatus, AppError> {
        if let Some(artist_id) = artists.get(&row.artist) {
            if let Some(item_id) = releases.get(&(*artist_id, row.release.clone())) {
                return Ok(RowStatus::Exists { item_id: *item_id });
            }
        }

        let image_path = file.image_path(row);
        let image = match std::fs::read(&image_path) {
            Ok(image) => image,
            Err(e) => {
                return Ok(RowStatus::Skipped {
                    message: format!("failed to read {}: {e}", image_path.display()),
                })
            }
        };
        if let Err(e) = preprocess::load_square(&image) {
            return Ok(RowStatus::Skipped {
                message: format!("{}: {e}", image_path.display()),
            });
        }

        let artist_id = match artists.get(&row.artist) {
            Some(id) => *id,
            None => {
                let artist = self.catalog.create(CatalogItemCreate {
                    parent_id: None,
                    title: row.artist.clone(),
                    image: None,
                })?;
                log::info!("added artist={} name={:?}", artist.id, artist.title);
                artists.insert(row.artist.clone(), artist.id);
                artist.id
            }
        };

        let item = self.create_item(row.release.clone(), Some(artist_id), &image)?;
        releases.insert((artist_id, row.release.clone()), item.id);

        Ok(RowStatus::Created { item_id: item.id })
    }

    /// Store the image and create the catalog item pointing at it.
    fn create_item(
        &self,
        title: String,
        parent_id: Option<u64>,
        image: &[u8],
    ) -> Result<CatalogItem, AppError> {
        let file_name = self.save_image(image)?;

        let item = match self.catalog.create(CatalogItemCreate {
            parent_id,
            title,
            image: Some(file_name.clone()),
        }) {
            Ok(item) => item,
            Err(e) => {
                self.delete_media(&file_name);
                return Err(e.into());
            }
        };
        log::info!("added item={} title={:?}", item.id, item.title);

        Ok(item)
    }

    fn ingest_one(&self, id: u64) -> ItemReport {
        let mut report = self.pipeline.ingest_batch(&[id]);
        report.items.remove(0)
    }

    fn save_image(&self, image: &[u8]) -> Result<String, AppError> {
        preprocess::load_square(image).map_err(|e| AppError::InvalidImage(e.to_string()))?;

        let ext = preprocess::detect_format(image)
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("img");
        let file_name = format!("{}.{ext}", rusty_ulid::generate_ulid_string());

        self.media.write(&file_name, image)?;
        Ok(file_name)
    }

    fn delete_media(&self, file_name: &str) {
        if let Err(e) = self.media.delete(file_name) {
            log::warn!("failed to delete media {file_name}: {e}");
        }
    }
}
