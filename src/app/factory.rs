use crate::{
    app::service::{App, AppParts},
    cache::ResultCache,
    catalog::BackendCsv,
    config::Config,
    fingerprint::{build_embedder, LocalFingerprintStore},
    metadata::MetadataOrchestrator,
    storage,
};
use anyhow::{Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builds the application from the files under the base path.
pub struct AppFactory;

impl AppFactory {
    /// Load config and open catalog, fingerprint store and result cache.
    pub fn create_app(paths: &AppPaths) -> Result<App> {
        let config = Config::load_with(&paths.base_path)
            .with_context(|| format!("Failed to load config from {}", paths.base_path.display()))?;

        let media = storage::BackendLocal::new(&paths.media_path)
            .context("Failed to create media directory")?;
        let catalog = BackendCsv::load(&paths.catalog_path, Box::new(media.clone()))
            .context("Failed to load catalog")?;

        let embedder = build_embedder(&config.embedding, paths.base_path.clone())
            .context("Failed to set up embedding model")?;

        let store = LocalFingerprintStore::open(
            paths.vectors_path.clone(),
            embedder.model_id(),
            config.embedding.dimensions,
            config.embedding.metric,
        )
        .context("Failed to open fingerprint store")?;

        let cache_dir = storage::BackendLocal::new(&paths.cache_path)
            .context("Failed to create cache directory")?;
        let cache = ResultCache::open(
            Box::new(cache_dir),
            config.cache.volatile_capacity,
            Duration::from_secs(config.cache.ttl_secs),
        )
        .context("Failed to open result cache")?;

        let metadata = MetadataOrchestrator::new(&config.metadata)
            .context("Failed to set up metadata collectors")?;

        let app = App::new(
            config,
            AppParts {
                catalog: Arc::new(catalog),
                media: Arc::new(media),
                embedder,
                store: Arc::new(store),
                cache: Arc::new(cache),
                metadata,
            },
        )?;

        Ok(app)
    }

    /// Get application paths, creating the base directory.
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;

        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths::new(base_path))
    }

    fn get_base_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("CRATEDIG_BASE_PATH") {
            return Ok(PathBuf::from(path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/cratedig"))
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    pub catalog_path: PathBuf,
    pub media_path: PathBuf,
    pub vectors_path: PathBuf,
    pub cache_path: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            catalog_path: base_path.join("catalog.csv"),
            media_path: base_path.join("media"),
            vectors_path: base_path.join("vectors.bin"),
            cache_path: base_path.join("cache"),
            base_path,
        }
    }
}
