//! Identification service: image bytes in, match decision out.
//!
//! Flow per request:
//! 1. Derive the query key from the model id and the raw bytes
//! 2. Serve from the result cache when the stored decision was made with
//!    the current thresholds
//! 3. Otherwise join (or start) the single in-flight computation for the
//!    key: embed, search, decide, publish to the cache
//!
//! The computation runs detached from the request, so a request that is
//! cancelled or times out never stops other waiters from getting the
//! result, and never leaves the key locked.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::cache::{short_key, CacheTier, ResultCache};
use crate::config::Config;
use crate::fingerprint::{query_digest, Embedder, EmbeddingError, FingerprintStore, StoreError};
use crate::matching::{MatchPolicy, MatchResult, ThresholdsKey};
use crate::retry::Backoff;
use crate::singleflight::{FlightError, Role, SingleFlight};

/// Failure to identify. No-match and ambiguous outcomes are not errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifyError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("fingerprint index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("identification timed out after {0}s")]
    Timeout(u64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EmbeddingError> for IdentifyError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::InvalidImage(e) => IdentifyError::InvalidImage(e.to_string()),
            EmbeddingError::ModelUnavailable(msg) => IdentifyError::ModelUnavailable(msg),
            e @ EmbeddingError::InvalidModel(_) => IdentifyError::ModelUnavailable(e.to_string()),
        }
    }
}

impl From<StoreError> for IdentifyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => IdentifyError::IndexUnavailable(msg),
            e @ StoreError::Storage(_) => IdentifyError::IndexUnavailable(e.to_string()),
            e @ StoreError::Index(_) => IdentifyError::Internal(e.to_string()),
        }
    }
}

impl IdentifyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IdentifyError::ModelUnavailable(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentifySettings {
    pub timeout: Duration,
    pub retry: Backoff,
    pub search_k: usize,
    pub cache_ttl: Duration,
}

impl From<&Config> for IdentifySettings {
    fn from(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.identify.timeout_secs),
            retry: Backoff::new(config.identify.max_retries, config.identify.retry_base_delay_ms),
            search_k: config.matching.search_k,
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
        }
    }
}

type Outcome = Result<MatchResult, IdentifyError>;

/// Flights are keyed by query key, cache epoch and thresholds: a request
/// never joins a computation that started before an invalidation, or one
/// deciding under thresholds other than its own.
type FlightKey = (String, u64, ThresholdsKey);

pub struct Identifier {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn FingerprintStore>,
    cache: Arc<ResultCache>,
    policy: RwLock<MatchPolicy>,
    flights: SingleFlight<FlightKey, Outcome>,
    settings: IdentifySettings,
}

/// Everything the detached computation needs.
#[derive(Clone)]
struct Computation {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn FingerprintStore>,
    cache: Arc<ResultCache>,
    settings: IdentifySettings,
}

impl Identifier {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn FingerprintStore>,
        cache: Arc<ResultCache>,
        policy: MatchPolicy,
        settings: IdentifySettings,
    ) -> Self {
        Self {
            embedder,
            store,
            cache,
            policy: RwLock::new(policy),
            flights: SingleFlight::new(),
            settings,
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        match self.policy.read() {
            Ok(policy) => *policy,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Swap thresholds; cached results made with other thresholds are
    /// recomputed on their next lookup.
    pub fn set_policy(&self, policy: MatchPolicy) {
        match self.policy.write() {
            Ok(mut current) => *current = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
    }

    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Number of computations currently running
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    pub async fn identify(&self, image: Vec<u8>) -> Result<MatchResult, IdentifyError> {
        let key = query_digest(self.embedder.model_id(), &image);
        let policy = self.policy();

        match lookup_blocking(&self.cache, &key).await {
            Ok(Some((result, tier))) if result.thresholds == policy.thresholds() => {
                log::debug!(
                    "identify key={} cache={} decision={}",
                    short_key(&key),
                    tier_name(tier),
                    result.decision
                );
                return Ok(result);
            }
            Ok(Some(_)) => {
                log::debug!("identify key={} cached with other thresholds", short_key(&key));
            }
            Ok(None) => {}
            Err(e) => log::warn!("cache lookup failed key={}: {e}", short_key(&key)),
        }

        let epoch = self
            .cache
            .epoch()
            .map_err(|e| IdentifyError::Internal(e.to_string()))?;

        let computation = Computation {
            embedder: self.embedder.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            settings: self.settings,
        };
        let flight_key = (key.clone(), epoch, policy.thresholds().key());
        let flight = self.flights.run(flight_key, {
            let key = key.clone();
            move || computation.run(key, image, epoch, policy)
        });

        let timeout = self.settings.timeout;
        match tokio::time::timeout(timeout, flight).await {
            Ok(Ok((outcome, role))) => {
                if role == Role::Follower {
                    log::debug!("identify key={} joined in-flight computation", short_key(&key));
                }
                outcome
            }
            Ok(Err(FlightError::Abandoned)) => Err(IdentifyError::Internal(
                "identification task ended without a result".to_string(),
            )),
            Err(_) => {
                log::warn!("identify key={} timed out waiting", short_key(&key));
                Err(IdentifyError::Timeout(timeout.as_secs()))
            }
        }
    }

    /// Catalog hook for a deleted item: drop its fingerprint, then every
    /// cached result that references it.
    ///
    /// The cache is invalidated even when the store fails to persist the
    /// removal; the store error is returned afterwards.
    pub fn forget_item(&self, item_id: u64) -> Result<(), IdentifyError> {
        let removed = self.store.remove(item_id);
        self.cache
            .invalidate(item_id)
            .map_err(|e| IdentifyError::Internal(e.to_string()))?;
        removed?;
        Ok(())
    }
}

fn tier_name(tier: CacheTier) -> &'static str {
    match tier {
        CacheTier::Volatile => "volatile",
        CacheTier::Durable => "durable",
    }
}

fn join_error(e: tokio::task::JoinError) -> IdentifyError {
    IdentifyError::Internal(format!("blocking task failed: {e}"))
}

/// Cache lookups may read the durable tier, so they stay off the executor.
async fn lookup_blocking(
    cache: &Arc<ResultCache>,
    key: &str,
) -> Result<Option<(MatchResult, CacheTier)>, IdentifyError> {
    let cache = cache.clone();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || cache.lookup(&key))
        .await
        .map_err(join_error)?
        .map_err(|e| IdentifyError::Internal(e.to_string()))
}

impl Computation {
    async fn run(self, key: String, image: Vec<u8>, epoch: u64, policy: MatchPolicy) -> Outcome {
        // a flight that finished between our cache miss and this one starting
        if let Ok(Some((result, _))) = lookup_blocking(&self.cache, &key).await {
            if result.thresholds == policy.thresholds() {
                return Ok(result);
            }
        }

        let timeout = self.settings.timeout;
        let outcome = match tokio::time::timeout(timeout, self.compute(&key, image, policy)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(IdentifyError::Timeout(timeout.as_secs())),
        };

        match &outcome {
            Ok(result) => {
                log::info!(
                    "identify key={} decision={} best={:?}",
                    short_key(&key),
                    result.decision,
                    result.best().map(|c| (c.item_id, c.distance))
                );
                self.publish(&key, result, epoch).await;
            }
            Err(e) => log::warn!("identify key={} failed: {e}", short_key(&key)),
        }

        outcome
    }

    async fn compute(&self, key: &str, image: Vec<u8>, policy: MatchPolicy) -> Outcome {
        let image = Arc::new(image);

        let fingerprint = self
            .settings
            .retry
            .run(
                &format!("embed key={}", short_key(key)),
                || {
                    let embedder = self.embedder.clone();
                    let image = image.clone();
                    async move {
                        tokio::task::spawn_blocking(move || embedder.embed(&image))
                            .await
                            .map_err(join_error)?
                            .map_err(IdentifyError::from)
                    }
                },
                IdentifyError::is_transient,
            )
            .await?;

        let store = self.store.clone();
        let k = self.settings.search_k;
        let neighbors = tokio::task::spawn_blocking(move || store.search(&fingerprint, k))
            .await
            .map_err(join_error)??;

        Ok(policy.decide(&neighbors))
    }

    async fn publish(&self, key: &str, result: &MatchResult, epoch: u64) {
        let cache = self.cache.clone();
        let ttl = self.settings.cache_ttl;
        let (owned_key, result) = (key.to_string(), result.clone());
        let published = tokio::task::spawn_blocking(move || {
            cache.put_if_current(&owned_key, &result, ttl, epoch)
        })
        .await;

        match published {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                log::debug!("identify key={} result not cached: catalog changed", short_key(key))
            }
            Ok(Err(e)) => log::warn!("failed to cache result key={}: {e}", short_key(key)),
            Err(e) => log::warn!("failed to cache result key={}: {e}", short_key(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::index::IndexError;
    use crate::fingerprint::PreprocessError;

    #[test]
    fn test_embedding_errors_map_to_taxonomy() {
        let invalid: IdentifyError = EmbeddingError::InvalidImage(PreprocessError::Empty).into();
        assert!(matches!(invalid, IdentifyError::InvalidImage(_)));
        assert!(!invalid.is_transient());

        let unavailable: IdentifyError =
            EmbeddingError::ModelUnavailable("download failed".to_string()).into();
        assert_eq!(
            unavailable,
            IdentifyError::ModelUnavailable("download failed".to_string())
        );
        assert!(unavailable.is_transient());
    }

    #[test]
    fn test_store_errors_fail_closed() {
        let err: IdentifyError = StoreError::Unavailable("poisoned".to_string()).into();
        assert_eq!(err, IdentifyError::IndexUnavailable("poisoned".to_string()));

        let err: IdentifyError = StoreError::Index(IndexError::ZeroNormVector).into();
        assert!(matches!(err, IdentifyError::Internal(_)));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::default();
        let settings = IdentifySettings::from(&config);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.search_k, 10);
        assert_eq!(settings.cache_ttl, Duration::from_secs(86_400));
        assert_eq!(settings.retry.max_retries, 2);
    }
}
