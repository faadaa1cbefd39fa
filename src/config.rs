use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fingerprint::{self, Metric};
use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Distances at or below this are a definite match
const DEFAULT_HIGH_THRESHOLD: f32 = 0.08;
/// Distances at or below this (and above `high`) are ambiguous
const DEFAULT_LOW_THRESHOLD: f32 = 0.25;
const DEFAULT_AMBIGUOUS_SET_SIZE: usize = 3;
const DEFAULT_SEARCH_K: usize = 10;

/// One day
const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;
const DEFAULT_VOLATILE_CAPACITY: usize = 1024;

const DEFAULT_IDENTIFY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDENTIFY_MAX_RETRIES: u32 = 2;
const DEFAULT_IDENTIFY_RETRY_DELAY_MS: u64 = 200;

const DEFAULT_INGEST_PARALLELISM: usize = 4;
const DEFAULT_INGEST_MAX_RETRIES: u32 = 3;
const DEFAULT_INGEST_RETRY_DELAY_MS: u64 = 500;

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_BODY_LIMIT_MB: usize = 25;

const DEFAULT_USER_AGENT: &str = "cratedig/0.1 (record identification)";
const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("config file is not valid utf8")]
    NotUtf8,

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Embedding model and fingerprint layout
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name (e.g., "pixel-grid-16", "clip-vit-b32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Fingerprint length; must equal the model's native dimensionality
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default)]
    pub metric: Metric,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            dimensions: default_dimensions(),
            metric: Metric::default(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_model() -> String {
    fingerprint::DEFAULT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    fingerprint::DEFAULT_DIMENSIONS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

/// Match decision thresholds, read on every identification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_high")]
    pub high: f32,

    #[serde(default = "default_low")]
    pub low: f32,

    #[serde(default = "default_ambiguous_set_size")]
    pub ambiguous_set_size: usize,

    /// Return the closest candidates as weak suggestions on `none`
    #[serde(default)]
    pub weak_suggestions: bool,

    /// Neighbors fetched per search
    #[serde(default = "default_search_k")]
    pub search_k: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_THRESHOLD,
            low: DEFAULT_LOW_THRESHOLD,
            ambiguous_set_size: DEFAULT_AMBIGUOUS_SET_SIZE,
            weak_suggestions: false,
            search_k: DEFAULT_SEARCH_K,
        }
    }
}

fn default_high() -> f32 {
    DEFAULT_HIGH_THRESHOLD
}

fn default_low() -> f32 {
    DEFAULT_LOW_THRESHOLD
}

fn default_ambiguous_set_size() -> usize {
    DEFAULT_AMBIGUOUS_SET_SIZE
}

fn default_search_k() -> usize {
    DEFAULT_SEARCH_K
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Max entries held in memory
    #[serde(default = "default_volatile_capacity")]
    pub volatile_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            volatile_capacity: DEFAULT_VOLATILE_CAPACITY,
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_volatile_capacity() -> usize {
    DEFAULT_VOLATILE_CAPACITY
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentifyConfig {
    /// Upper bound a caller waits for a result
    #[serde(default = "default_identify_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_identify_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_identify_retry_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_IDENTIFY_TIMEOUT_SECS,
            max_retries: DEFAULT_IDENTIFY_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_IDENTIFY_RETRY_DELAY_MS,
        }
    }
}

fn default_identify_timeout_secs() -> u64 {
    DEFAULT_IDENTIFY_TIMEOUT_SECS
}

fn default_identify_max_retries() -> u32 {
    DEFAULT_IDENTIFY_MAX_RETRIES
}

fn default_identify_retry_delay_ms() -> u64 {
    DEFAULT_IDENTIFY_RETRY_DELAY_MS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Worker threads for batch ingestion
    #[serde(default = "default_ingest_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_ingest_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_ingest_retry_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_INGEST_PARALLELISM,
            max_retries: DEFAULT_INGEST_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_INGEST_RETRY_DELAY_MS,
        }
    }
}

fn default_ingest_parallelism() -> usize {
    DEFAULT_INGEST_PARALLELISM
}

fn default_ingest_max_retries() -> u32 {
    DEFAULT_INGEST_MAX_RETRIES
}

fn default_ingest_retry_delay_ms() -> u64 {
    DEFAULT_INGEST_RETRY_DELAY_MS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            body_limit_mb: DEFAULT_BODY_LIMIT_MB,
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_body_limit_mb() -> usize {
    DEFAULT_BODY_LIMIT_MB
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_metadata_timeout_secs")]
    pub timeout_secs: u64,

    /// Discogs personal access token. Falls back to `DISCOGS_TOKEN`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discogs_token: Option<String>,

    /// Falls back to `SPOTIFY_CLIENT_ID`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spotify_client_id: Option<String>,

    /// Falls back to `SPOTIFY_CLIENT_SECRET`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spotify_client_secret: Option<String>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: DEFAULT_METADATA_TIMEOUT_SECS,
            discogs_token: None,
            spotify_client_id: None,
            spotify_client_secret: None,
        }
    }
}

impl MetadataConfig {
    pub fn discogs_token(&self) -> Option<String> {
        credential(&self.discogs_token, "DISCOGS_TOKEN")
    }

    /// Client id and secret, when both are set.
    pub fn spotify_credentials(&self) -> Option<(String, String)> {
        let id = credential(&self.spotify_client_id, "SPOTIFY_CLIENT_ID")?;
        let secret = credential(&self.spotify_client_secret, "SPOTIFY_CLIENT_SECRET")?;
        Some((id, secret))
    }
}

fn credential(configured: &Option<String>, var: &str) -> Option<String> {
    configured
        .clone()
        .or_else(|| std::env::var(var).ok())
        .filter(|value| !value.trim().is_empty())
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_metadata_timeout_secs() -> u64 {
    DEFAULT_METADATA_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub identify: IdentifyConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let emb = &self.embedding;
        if emb.dimensions == 0 {
            return invalid("embedding.dimensions must be greater than 0".to_string());
        }
        let native = fingerprint::native_dimensions(&emb.model)
            .map_err(|e| ConfigError::Invalid(format!("embedding.model: {e}")))?;
        if native != emb.dimensions {
            return invalid(format!(
                "embedding.dimensions is {} but model '{}' produces {}",
                emb.dimensions, emb.model, native
            ));
        }
        if emb.download_timeout_secs == 0 {
            return invalid("embedding.download_timeout_secs must be greater than 0".to_string());
        }

        let m = &self.matching;
        let max = emb.metric.max_distance();
        for (name, value) in [("high", m.high), ("low", m.low)] {
            if !(0.0..=max).contains(&value) {
                return invalid(format!(
                    "matching.{name} must be between 0.0 and {max} for {} distance, got {value}",
                    emb.metric.name()
                ));
            }
        }
        if m.high >= m.low {
            return invalid(format!(
                "matching.high ({}) must be less than matching.low ({})",
                m.high, m.low
            ));
        }
        if m.ambiguous_set_size == 0 {
            return invalid("matching.ambiguous_set_size must be greater than 0".to_string());
        }
        if m.search_k < m.ambiguous_set_size {
            return invalid(format!(
                "matching.search_k ({}) must be at least matching.ambiguous_set_size ({})",
                m.search_k, m.ambiguous_set_size
            ));
        }

        if self.cache.volatile_capacity == 0 {
            return invalid("cache.volatile_capacity must be greater than 0".to_string());
        }
        if self.identify.timeout_secs == 0 {
            return invalid("identify.timeout_secs must be greater than 0".to_string());
        }
        if self.ingest.parallelism == 0 {
            return invalid("ingest.parallelism must be greater than 0".to_string());
        }
        if self.daemon.body_limit_mb == 0 {
            return invalid("daemon.body_limit_mb must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).map_err(|_| ConfigError::NotUtf8)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            log::info!("Upgrading {CONFIG_FILE} with new defaults");
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.embedding.model, "pixel-grid-16");
        assert_eq!(config.embedding.dimensions, 256);
        assert_eq!(config.matching.ambiguous_set_size, 3);
        assert!(config.matching.high < config.matching.low);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path()).unwrap();

        assert!(dir.path().join("config.yaml").exists());
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.base_path(), dir.path());
    }

    #[test]
    fn test_partial_file_filled_and_resaved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "matching:\n  high: 0.05\n  low: 0.3\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.matching.high, 0.05);
        assert_eq!(config.matching.low, 0.3);
        assert_eq!(config.matching.search_k, 10);

        let saved = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
        assert!(saved.contains("volatile_capacity"));
    }

    #[test]
    fn test_metadata_credentials_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "metadata:\n  discogs_token: abc\n  spotify_client_id: id\n  spotify_client_secret: secret\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.metadata.discogs_token().as_deref(), Some("abc"));
        assert_eq!(
            config.metadata.spotify_credentials(),
            Some(("id".to_string(), "secret".to_string()))
        );
        assert_eq!(config.metadata.timeout_secs, DEFAULT_METADATA_TIMEOUT_SECS);

        let blank = MetadataConfig {
            discogs_token: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(blank.discogs_token(), None);
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "matching: [not, a, map").unwrap();

        assert!(matches!(
            Config::load_with(dir.path()),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn test_threshold_validation() {
        let mut config = Config::default();
        config.matching.high = 0.3;
        config.matching.low = 0.2;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.matching.low = 2.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.matching.high = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_size_and_k_validation() {
        let mut config = Config::default();
        config.matching.ambiguous_set_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.matching.search_k = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_dimensions_must_agree() {
        let mut config = Config::default();
        config.embedding.dimensions = 512;
        assert!(config.validate().is_err());

        config.embedding.model = "pixel-grid-8".to_string();
        config.embedding.dimensions = 64;
        config.validate().unwrap();

        config.embedding.model = "no-such-model".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = Config::default();
        config.cache.volatile_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ingest.parallelism = 0;
        assert!(config.validate().is_err());
    }
}
