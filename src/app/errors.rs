use crate::{
    cache::CacheError, catalog::CatalogError, config::ConfigError, fingerprint::StoreError,
    identify::IdentifyError, import::ImportError, ingest::IngestError, metadata::MetadataError,
};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("item {0} not found")]
    NotFound(u64),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Identify(#[from] IdentifyError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
