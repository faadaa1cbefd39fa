use std::time::Duration;

use serde_json::{json, Value};

use super::{MetadataCollector, MetadataError, RecordQuery};
use crate::config::MetadataConfig;

const SEARCH_URL: &str = "https://api.discogs.com/database/search";
const RELEASE_URL: &str = "https://api.discogs.com/releases/";
const ARTIST_URL: &str = "https://www.discogs.com/artist/";

/// Discogs database search. Prefers the earliest CD pressing of a release.
pub struct DiscogsCollector {
    client: reqwest::blocking::Client,
    token: String,
}

impl DiscogsCollector {
    pub fn new(config: &MetadataConfig, token: String) -> Result<Self, MetadataError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, token })
    }

    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, MetadataError> {
        Ok(self
            .client
            .get(url)
            .header("Authorization", format!("Discogs token={}", self.token))
            .query(query)
            .send()?
            .error_for_status()?
            .json::<Value>()?)
    }
}

impl MetadataCollector for DiscogsCollector {
    fn name(&self) -> &'static str {
        "discogs"
    }

    fn fetch(&self, query: &RecordQuery) -> Result<Option<Value>, MetadataError> {
        let search = self.get(
            SEARCH_URL,
            &[
                ("q", query.album.as_str()),
                ("artist", query.artist.as_str()),
                ("type", "release"),
                ("per_page", "50"),
            ],
        )?;
        let results = search
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or_else(|| MetadataError::Response("missing results array".to_string()))?;

        let Some(id) = pick_release(results).and_then(|r| r.get("id")).and_then(|v| v.as_u64())
        else {
            log::debug!("discogs has no CD release of {query}");
            return Ok(None);
        };

        let release = self.get(&format!("{RELEASE_URL}{id}"), &[])?;
        Ok(Some(normalize(&release, &query.artist, earliest_month(results))))
    }
}

fn year(result: &Value) -> Option<u32> {
    let year = result.get("year")?;
    let year = match year {
        Value::String(s) => s.trim().parse().ok()?,
        other => u32::try_from(other.as_u64()?).ok()?,
    };
    (year > 0).then_some(year)
}

fn is_cd(result: &Value) -> bool {
    result
        .get("format")
        .and_then(|v| v.as_array())
        .is_some_and(|formats| {
            formats
                .iter()
                .filter_map(|f| f.as_str())
                .any(|f| f.eq_ignore_ascii_case("cd"))
        })
}

/// Earliest CD release among search results; results without a year sort last.
pub fn pick_release(results: &[Value]) -> Option<&Value> {
    results
        .iter()
        .filter(|r| is_cd(r))
        .min_by_key(|r| year(r).unwrap_or(u32::MAX))
}

/// Earliest year any search result reports, as `YYYY-01`.
pub fn earliest_month(results: &[Value]) -> Option<String> {
    results
        .iter()
        .filter_map(year)
        .min()
        .map(|year| format!("{year}-01"))
}

/// Discogs titles often repeat the artist: `"Miles Davis - Kind Of Blue"`.
fn strip_artist<'a>(title: &'a str, artist: &str) -> &'a str {
    let head = title.get(..artist.len());
    if !head.is_some_and(|head| head.eq_ignore_ascii_case(artist)) {
        return title;
    }

    let rest = title[artist.len()..].trim_start();
    match rest.strip_prefix(['-', ':']) {
        Some(album) => album.trim(),
        None => title,
    }
}

/// `"m:ss"` to seconds.
fn duration_secs(duration: &str) -> Option<u64> {
    let (minutes, seconds) = duration.split_once(':')?;
    Some(minutes.trim().parse::<u64>().ok()? * 60 + seconds.trim().parse::<u64>().ok()?)
}

/// Reduce a release resource to the common record shape. `fallback_date`
/// is used when the release itself has no year.
pub fn normalize(release: &Value, artist_query: &str, fallback_date: Option<String>) -> Value {
    let artist = release
        .get("artists")
        .and_then(|v| v.as_array())
        .and_then(|artists| artists.first());
    let artist_url = artist
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_u64())
        .map(|id| format!("{ARTIST_URL}{id}"));

    let name = release
        .get("title")
        .and_then(|v| v.as_str())
        .map(|title| strip_artist(title, artist_query));
    let release_date = year(release)
        .map(|year| format!("{year}-01"))
        .or(fallback_date);

    let tracks: Vec<Value> = release
        .get("tracklist")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .map(|track| {
                    json!({
                        "name": track.get("title").and_then(|v| v.as_str()),
                        "duration": track.get("duration").and_then(|v| v.as_str()).and_then(duration_secs),
                        "explicit": Value::Null,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "artist": {
            "name": artist.and_then(|a| a.get("name")).and_then(|v| v.as_str()),
            "url": artist_url,
        },
        "album": {
            "name": name,
            "genres": release.get("genres").filter(|v| v.as_array().is_some_and(|g| !g.is_empty())),
            "image": release
                .get("images")
                .and_then(|v| v.as_array())
                .and_then(|images| images.first())
                .and_then(|image| image.get("uri")),
            "release_date": release_date,
            "total_tracks": tracks.len(),
            "tracks": tracks,
            "url": release.get("uri").and_then(|v| v.as_str()),
        },
    })
}
