use std::time::Duration;

use serde_json::{json, Value};

use super::{release_month, MetadataCollector, MetadataError, RecordQuery};
use crate::config::MetadataConfig;

const SEARCH_URL: &str = "https://musicbrainz.org/ws/2/release/";
const ARTIST_URL: &str = "https://musicbrainz.org/artist/";
const RELEASE_URL: &str = "https://musicbrainz.org/release/";

pub struct MusicBrainzCollector {
    client: reqwest::blocking::Client,
}

impl MusicBrainzCollector {
    pub fn new(config: &MetadataConfig) -> Result<Self, MetadataError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client })
    }
}

impl MetadataCollector for MusicBrainzCollector {
    fn name(&self) -> &'static str {
        "musicbrainz"
    }

    fn fetch(&self, query: &RecordQuery) -> Result<Option<Value>, MetadataError> {
        let lucene = format!(
            "release:\"{}\" AND artist:\"{}\"",
            escape(&query.album),
            escape(&query.artist)
        );

        let response = self
            .client
            .get(SEARCH_URL)
            .query(&[("query", lucene.as_str()), ("limit", "1"), ("fmt", "json")])
            .send()?
            .error_for_status()?
            .json::<Value>()?;

        normalize(&response)
    }
}

fn escape(term: &str) -> String {
    term.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Reduce a release search response to the common record shape.
pub fn normalize(response: &Value) -> Result<Option<Value>, MetadataError> {
    let releases = response
        .get("releases")
        .and_then(|v| v.as_array())
        .ok_or_else(|| MetadataError::Response("missing releases array".to_string()))?;

    let Some(release) = releases.first() else {
        return Ok(None);
    };

    let artist = release
        .get("artist-credit")
        .and_then(|v| v.as_array())
        .and_then(|credits| credits.first())
        .and_then(|credit| credit.get("artist"));
    let artist_name = artist.and_then(|a| a.get("name")).and_then(|v| v.as_str());
    let artist_url = artist
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .map(|id| format!("{ARTIST_URL}{id}"));

    let release_url = release
        .get("id")
        .and_then(|v| v.as_str())
        .map(|id| format!("{RELEASE_URL}{id}"));
    let release_date = release
        .get("date")
        .and_then(|v| v.as_str())
        .and_then(release_month);
    let total_tracks = release.get("track-count").and_then(|v| v.as_u64());

    Ok(Some(json!({
        "artist": {
            "name": artist_name,
            "url": artist_url,
        },
        "album": {
            "name": release.get("title").and_then(|v| v.as_str()),
            "release_date": release_date,
            "total_tracks": total_tracks,
            "url": release_url,
        },
    })))
}
