//! Visual fingerprinting of catalog images.
//!
//! # Architecture
//!
//! - `preprocess`: Format checks, square crop, content digests
//! - `embeddings`: Image -> fingerprint models (built-in pixel grid, fastembed)
//! - `index`: In-memory vector index with exact nearest-neighbor search
//! - `storage`: Binary file I/O for vectors.bin persistence
//! - `store`: Shared, persistent fingerprint store used by identify and ingest

pub mod embeddings;
pub mod index;
pub mod preprocess;
pub mod storage;
pub mod store;

pub use embeddings::{build_embedder, native_dimensions, Embedder, EmbeddingError, Fingerprint};
pub use index::{Metric, Neighbor, VectorIndex};
pub use preprocess::{image_hash, query_digest, PreprocessError};
pub use store::{FingerprintStore, LocalFingerprintStore, StoreError, UpsertOutcome};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "pixel-grid-16";

/// Dimensionality of the default model
pub const DEFAULT_DIMENSIONS: usize = 256;
