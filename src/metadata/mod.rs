//! Release metadata from independent providers, and reconciliation of
//! what they report.

pub mod discogs;
pub mod musicbrainz;
pub mod spotify;

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::MetadataConfig;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("query must look like \"<artist> - <album>\", got {0:?}")]
    InvalidQuery(String),

    #[error("unknown sources: {}", .0.join(", "))]
    UnknownSources(Vec<String>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Response(String),
}

/// A parsed `"{artist} - {album}"` lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub artist: String,
    pub album: String,
}

impl RecordQuery {
    pub fn parse(query: &str) -> Result<Self, MetadataError> {
        let (artist, album) = query
            .split_once(" - ")
            .ok_or_else(|| MetadataError::InvalidQuery(query.to_string()))?;

        let (artist, album) = (artist.trim(), album.trim());
        if artist.is_empty() || album.is_empty() {
            return Err(MetadataError::InvalidQuery(query.to_string()));
        }

        Ok(Self {
            artist: artist.to_string(),
            album: album.to_string(),
        })
    }
}

impl std::fmt::Display for RecordQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.artist, self.album)
    }
}

/// A metadata provider.
///
/// Collectors normalise provider responses to
/// `{"artist": {...}, "album": {...}}` so results can be compared field by
/// field.
pub trait MetadataCollector: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the provider has no match.
    fn fetch(&self, query: &RecordQuery) -> Result<Option<Value>, MetadataError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceResult {
    Found { metadata: Value },
    NotFound,
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub source: String,
    #[serde(flatten)]
    pub result: SourceResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectedMetadata {
    pub query: String,
    /// In request order
    pub sources: Vec<SourceReport>,
}

impl CollectedMetadata {
    pub fn found(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.sources.iter().filter_map(|report| match &report.result {
            SourceResult::Found { metadata } => Some((report.source.as_str(), metadata)),
            _ => None,
        })
    }
}

/// Field-by-field agreement between sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Comparison {
    /// Dotted field path -> the single value every reporting source agrees on
    pub identical: BTreeMap<String, Value>,
    /// Dotted field path -> source -> value
    pub differences: BTreeMap<String, BTreeMap<String, Value>>,
}

pub struct MetadataOrchestrator {
    collectors: Vec<Box<dyn MetadataCollector>>,
}

impl MetadataOrchestrator {
    /// MusicBrainz always; Discogs and Spotify when their credentials are
    /// configured.
    pub fn new(config: &MetadataConfig) -> Result<Self, MetadataError> {
        let mut collectors: Vec<Box<dyn MetadataCollector>> =
            vec![Box::new(musicbrainz::MusicBrainzCollector::new(config)?)];

        match config.discogs_token() {
            Some(token) => collectors.push(Box::new(discogs::DiscogsCollector::new(config, token)?)),
            None => log::debug!("no Discogs token configured; skipping Discogs"),
        }
        match config.spotify_credentials() {
            Some((id, secret)) => {
                collectors.push(Box::new(spotify::SpotifyCollector::new(config, id, secret)?))
            }
            None => log::debug!("no Spotify credentials configured; skipping Spotify"),
        }

        Ok(Self::with_collectors(collectors))
    }

    pub fn with_collectors(collectors: Vec<Box<dyn MetadataCollector>>) -> Self {
        Self { collectors }
    }

    pub fn sources(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    /// Query the named sources (all when `None`) in parallel.
    ///
    /// A failing source only fails its own entry.
    pub fn collect(
        &self,
        query: &str,
        sources: Option<&[String]>,
    ) -> Result<CollectedMetadata, MetadataError> {
        let record = RecordQuery::parse(query)?;

        let selected: Vec<&dyn MetadataCollector> = match sources {
            None => self.collectors.iter().map(|c| c.as_ref()).collect(),
            Some(names) => {
                let unknown: Vec<String> = names
                    .iter()
                    .filter(|n| !self.collectors.iter().any(|c| c.name() == n.as_str()))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(MetadataError::UnknownSources(unknown));
                }
                names
                    .iter()
                    .filter_map(|n| self.collectors.iter().find(|c| c.name() == n.as_str()))
                    .map(|c| c.as_ref())
                    .collect()
            }
        };

        let results: Vec<SourceReport> = thread::scope(|s| {
            let handles: Vec<_> = selected
                .iter()
                .map(|collector| {
                    let record = &record;
                    s.spawn(move || {
                        let name = collector.name();
                        let result = match collector.fetch(record) {
                            Ok(Some(metadata)) => {
                                log::info!("collector={name} outcome=found");
                                SourceResult::Found { metadata }
                            }
                            Ok(None) => {
                                log::info!("collector={name} outcome=not_found");
                                SourceResult::NotFound
                            }
                            Err(e) => {
                                log::warn!("collector={name} outcome=error err={e}");
                                SourceResult::Error {
                                    error: e.to_string(),
                                }
                            }
                        };
                        SourceReport {
                            source: name.to_string(),
                            result,
                        }
                    })
                })
                .collect();

            handles
                .into_iter()
                .zip(selected.iter())
                .map(|(h, collector)| {
                    h.join().unwrap_or_else(|_| SourceReport {
                        source: collector.name().to_string(),
                        result: SourceResult::Error {
                            error: "collector panicked".to_string(),
                        },
                    })
                })
                .collect()
        });

        Ok(CollectedMetadata {
            query: record.to_string(),
            sources: results,
        })
    }
}

/// `YYYY-MM-DD` and `YYYY-MM` keep year and month; a bare `YYYY` becomes
/// `YYYY-01`.
pub fn release_month(date: &str) -> Option<String> {
    let mut parts = date.split('-');
    let year = parts.next().filter(|y| y.len() == 4 && y.bytes().all(|b| b.is_ascii_digit()))?;
    match parts.next() {
        Some(month) if month.len() == 2 && month.bytes().all(|b| b.is_ascii_digit()) => {
            Some(format!("{year}-{month}"))
        }
        Some(_) => None,
        None => Some(format!("{year}-01")),
    }
}

/// Flatten nested objects into dotted paths. Arrays are kept whole.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    fn walk(prefix: &str, map: &Map<String, Value>, out: &mut BTreeMap<String, Value>) {
        for (k, v) in map {
            let key = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            match v {
                Value::Object(inner) => walk(&key, inner, out),
                other => {
                    out.insert(key, other.clone());
                }
            }
        }
    }

    let mut out = BTreeMap::new();
    match value {
        Value::Object(map) => walk("", map, &mut out),
        other => {
            out.insert(String::new(), other.clone());
        }
    }
    out
}

/// Split the fields reported by the found sources into agreeing and
/// disagreeing ones. A field only some sources report is compared among
/// those sources.
pub fn compare(collected: &CollectedMetadata) -> Comparison {
    let mut grouped: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for (source, metadata) in collected.found() {
        for (field, value) in flatten(metadata) {
            grouped
                .entry(field)
                .or_default()
                .insert(source.to_string(), value);
        }
    }

    let mut comparison = Comparison::default();
    for (field, by_source) in grouped {
        let distinct: BTreeSet<String> = by_source.values().map(|v| v.to_string()).collect();
        if distinct.len() > 1 {
            comparison.differences.insert(field, by_source);
        } else if let Some(value) = by_source.into_values().next() {
            comparison.identical.insert(field, value);
        }
    }

    comparison
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticCollector {
        name: &'static str,
        response: Result<Option<Value>, &'static str>,
    }

    impl MetadataCollector for StaticCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn fetch(&self, _query: &RecordQuery) -> Result<Option<Value>, MetadataError> {
            self.response
                .clone()
                .map_err(|e| MetadataError::Response(e.to_string()))
        }
    }

    fn orchestrator() -> MetadataOrchestrator {
        MetadataOrchestrator::with_collectors(vec![
            Box::new(StaticCollector {
                name: "alpha",
                response: Ok(Some(json!({
                    "artist": {"name": "John Coltrane"},
                    "album": {"name": "Blue Train", "release_date": "1958-01", "total_tracks": 5}
                }))),
            }),
            Box::new(StaticCollector {
                name: "beta",
                response: Ok(Some(json!({
                    "artist": {"name": "John Coltrane"},
                    "album": {"name": "Blue Train", "release_date": "1957-09", "genres": ["jazz"]}
                }))),
            }),
            Box::new(StaticCollector {
                name: "broken",
                response: Err("rate limited"),
            }),
            Box::new(StaticCollector {
                name: "empty",
                response: Ok(None),
            }),
        ])
    }

    #[test]
    fn test_parse_query() {
        let q = RecordQuery::parse("The Beatles - Abbey Road").unwrap();
        assert_eq!(q.artist, "The Beatles");
        assert_eq!(q.album, "Abbey Road");

        // only the first separator splits
        let q = RecordQuery::parse("Sly - The Family Stone - Fresh").unwrap();
        assert_eq!(q.album, "The Family Stone - Fresh");

        assert!(RecordQuery::parse("Abbey Road").is_err());
        assert!(RecordQuery::parse(" - Abbey Road").is_err());
    }

    #[test]
    fn test_collect_reports_each_source() {
        let collected = orchestrator()
            .collect("John Coltrane - Blue Train", None)
            .unwrap();

        let names: Vec<&str> = collected.sources.iter().map(|r| r.source.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "broken", "empty"]);
        assert!(matches!(collected.sources[2].result, SourceResult::Error { .. }));
        assert_eq!(collected.sources[3].result, SourceResult::NotFound);
        assert_eq!(collected.found().count(), 2);
    }

    #[test]
    fn test_collect_selected_and_unknown_sources() {
        let orch = orchestrator();
        let collected = orch
            .collect("a - b", Some(&["beta".to_string()]))
            .unwrap();
        assert_eq!(collected.sources.len(), 1);
        assert_eq!(collected.sources[0].source, "beta");

        let err = orch
            .collect("a - b", Some(&["beta".to_string(), "spotify".to_string()]))
            .unwrap_err();
        assert!(matches!(err, MetadataError::UnknownSources(ref s) if s == &["spotify".to_string()]));
    }

    #[test]
    fn test_collectors_follow_credentials() {
        let config = MetadataConfig {
            discogs_token: Some("token".to_string()),
            spotify_client_id: Some("id".to_string()),
            spotify_client_secret: Some("secret".to_string()),
            ..Default::default()
        };
        let orch = MetadataOrchestrator::new(&config).unwrap();
        assert_eq!(orch.sources(), vec!["musicbrainz", "discogs", "spotify"]);
    }

    #[test]
    fn test_release_month() {
        assert_eq!(release_month("1957-09-01").as_deref(), Some("1957-09"));
        assert_eq!(release_month("1957-09").as_deref(), Some("1957-09"));
        assert_eq!(release_month("1957").as_deref(), Some("1957-01"));
        assert_eq!(release_month(""), None);
        assert_eq!(release_month("57-9"), None);
    }

    #[test]
    fn test_flatten_dotted_paths() {
        let flat = flatten(&json!({"album": {"name": "x", "tracks": [1, 2]}, "n": null}));
        assert_eq!(flat.get("album.name"), Some(&json!("x")));
        assert_eq!(flat.get("album.tracks"), Some(&json!([1, 2])));
        assert_eq!(flat.get("n"), Some(&Value::Null));
    }

    #[test]
    fn test_compare_splits_identical_and_differences() {
        let collected = orchestrator()
            .collect("John Coltrane - Blue Train", None)
            .unwrap();
        let comparison = compare(&collected);

        assert_eq!(comparison.identical.get("artist.name"), Some(&json!("John Coltrane")));
        assert_eq!(comparison.identical.get("album.name"), Some(&json!("Blue Train")));
        // reported by one source only
        assert_eq!(comparison.identical.get("album.total_tracks"), Some(&json!(5)));

        let dates = comparison.differences.get("album.release_date").unwrap();
        assert_eq!(dates.get("alpha"), Some(&json!("1958-01")));
        assert_eq!(dates.get("beta"), Some(&json!("1957-09")));
        assert!(!comparison.differences.contains_key("album.name"));
    }
}
