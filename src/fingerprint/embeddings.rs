//! Embedding functions mapping an image to a fingerprint.
//!
//! Two families are supported:
//! - `pixel-grid-N`: built-in, deterministic grayscale grid (N*N values)
//! - fastembed image models (`clip-vit-b32`, `resnet50`, ...), loaded lazily
//!   with a configurable cache directory
//!
//! Every embedder is stateless from the caller's point of view: the same
//! bytes under the same model id always produce the same fingerprint.

use std::path::PathBuf;
#[cfg(feature = "fastembed-models")]
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use image::imageops::FilterType;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::fingerprint::preprocess::{self, PreprocessError};

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Grid side limits for the built-in embedder
const MIN_GRID_SIDE: u32 = 4;
const MAX_GRID_SIDE: u32 = 64;

/// Immutable fixed-length fingerprint vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint(Box<[f32]>);

impl Fingerprint {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values.into_boxed_slice())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f32>> for Fingerprint {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] PreprocessError),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// A pure image -> fingerprint mapping for one model version.
pub trait Embedder: Send + Sync {
    /// Model identifier; part of every cache key and of the vectors.bin header
    fn model_id(&self) -> &str;

    /// Length of every fingerprint this embedder produces
    fn dimensions(&self) -> usize;

    fn embed(&self, image: &[u8]) -> Result<Fingerprint, EmbeddingError>;
}

/// Compute SHA256 hash of the model name for storage identification.
pub fn model_id_hash(model_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.finalize().into()
}

/// Native dimensionality of a model name, if known.
pub fn native_dimensions(model_name: &str) -> Result<usize, EmbeddingError> {
    match parse_model_name(model_name)? {
        ModelKind::PixelGrid(side) => Ok((side * side) as usize),
        #[cfg(feature = "fastembed-models")]
        ModelKind::Fastembed(_, dims) => Ok(dims),
    }
}

/// Build the embedder named in config.
pub fn build_embedder(
    config: &EmbeddingConfig,
    base_path: PathBuf,
) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    #[cfg(not(feature = "fastembed-models"))]
    let _ = base_path;

    match parse_model_name(&config.model)? {
        ModelKind::PixelGrid(side) => Ok(Arc::new(PixelGridEmbedder::new(side))),
        #[cfg(feature = "fastembed-models")]
        ModelKind::Fastembed(kind, dims) => Ok(Arc::new(FastembedImageModel::new(
            &config.model,
            kind,
            dims,
            base_path,
            Some(Duration::from_secs(config.download_timeout_secs)),
        ))),
    }
}

enum ModelKind {
    PixelGrid(u32),
    #[cfg(feature = "fastembed-models")]
    Fastembed(fastembed::ImageEmbeddingModel, usize),
}

/// Parse model name string to a model kind.
fn parse_model_name(name: &str) -> Result<ModelKind, EmbeddingError> {
    let lower = name.to_lowercase();

    if let Some(side) = lower.strip_prefix("pixel-grid-") {
        return match side.parse::<u32>() {
            Ok(side) if (MIN_GRID_SIDE..=MAX_GRID_SIDE).contains(&side) => {
                Ok(ModelKind::PixelGrid(side))
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "{name}: grid side must be between {MIN_GRID_SIDE} and {MAX_GRID_SIDE}"
            ))),
        };
    }

    match lower.as_str() {
        #[cfg(feature = "fastembed-models")]
        "clip-vit-b32" | "clipvitb32" => Ok(ModelKind::Fastembed(
            fastembed::ImageEmbeddingModel::ClipVitB32,
            512,
        )),
        #[cfg(feature = "fastembed-models")]
        "resnet50" => Ok(ModelKind::Fastembed(
            fastembed::ImageEmbeddingModel::Resnet50,
            2048,
        )),
        #[cfg(feature = "fastembed-models")]
        "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => Ok(ModelKind::Fastembed(
            fastembed::ImageEmbeddingModel::NomicEmbedVisionV15,
            768,
        )),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: pixel-grid-<4..64>, clip-vit-b32, resnet50, nomic-embed-vision-v1.5",
            name
        ))),
    }
}

/// Deterministic grayscale grid fingerprint.
///
/// The square-cropped image is resized to `side x side`, converted to
/// luminance, mean-centered and L2-normalised. Flat images (no contrast)
/// all map to the same uniform unit vector.
pub struct PixelGridEmbedder {
    side: u32,
    model_id: String,
}

impl PixelGridEmbedder {
    pub fn new(side: u32) -> Self {
        Self {
            side,
            model_id: format!("pixel-grid-{side}"),
        }
    }
}

impl Embedder for PixelGridEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        (self.side * self.side) as usize
    }

    fn embed(&self, image: &[u8]) -> Result<Fingerprint, EmbeddingError> {
        let img = preprocess::load_square(image)?;
        let grid = img
            .resize_exact(self.side, self.side, FilterType::Triangle)
            .to_luma8();

        let mut values: Vec<f32> = grid.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        values.iter_mut().for_each(|v| *v -= mean);

        let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            let uniform = 1.0 / (values.len() as f32).sqrt();
            values.iter_mut().for_each(|v| *v = uniform);
        } else {
            values.iter_mut().for_each(|v| *v /= norm);
        }

        Ok(Fingerprint::new(values))
    }
}

/// Wrapper around fastembed's ImageEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self; the model
/// is loaded on first use.
#[cfg(feature = "fastembed-models")]
pub struct FastembedImageModel {
    model: Mutex<Option<fastembed::ImageEmbedding>>,
    kind: fastembed::ImageEmbeddingModel,
    model_name: String,
    dimensions: usize,
    cache_dir: PathBuf,
    _download_timeout: Duration,
}

#[cfg(feature = "fastembed-models")]
impl FastembedImageModel {
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(
        model_name: &str,
        kind: fastembed::ImageEmbeddingModel,
        dimensions: usize,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Self {
        Self {
            model: Mutex::new(None),
            kind,
            model_name: model_name.to_string(),
            dimensions,
            cache_dir,
            _download_timeout: download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT),
        }
    }

    fn load(&self) -> Result<fastembed::ImageEmbedding, EmbeddingError> {
        log::info!("Loading image embedding model '{}'", self.model_name);

        let models_dir = self.cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::ModelUnavailable(format!("Failed to create models directory: {}", e))
        })?;

        let options = fastembed::ImageInitOptions::new(self.kind.clone())
            .with_cache_dir(models_dir)
            .with_show_download_progress(false);

        fastembed::ImageEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::ModelUnavailable(e.to_string()))
    }
}

#[cfg(feature = "fastembed-models")]
impl Embedder for FastembedImageModel {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, image: &[u8]) -> Result<Fingerprint, EmbeddingError> {
        // validate + crop with the same rules as every other model
        let square = preprocess::load_square(image)?;
        let mut png = Vec::new();
        square
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| PreprocessError::Decode(e.to_string()))?;

        let mut guard = self.model.lock().map_err(|e| {
            EmbeddingError::ModelUnavailable(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            *guard = Some(self.load()?);
        }

        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::ModelUnavailable("model not loaded".to_string()))?;

        let embeddings = model
            .embed_bytes(&[png.as_slice()], None)
            .map_err(|e| EmbeddingError::ModelUnavailable(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .map(Fingerprint::new)
            .ok_or_else(|| EmbeddingError::ModelUnavailable("No embedding returned".to_string()))
    }
}
