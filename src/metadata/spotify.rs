use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use super::{release_month, MetadataCollector, MetadataError, RecordQuery};
use crate::config::MetadataConfig;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";

/// Tokens are renewed this long before Spotify says they expire.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Spotify Web API with the client credentials flow.
pub struct SpotifyCollector {
    client: reqwest::blocking::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
}

impl SpotifyCollector {
    pub fn new(
        config: &MetadataConfig,
        client_id: String,
        client_secret: String,
    ) -> Result<Self, MetadataError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    fn access_token(&self) -> Result<String, MetadataError> {
        let mut token = self
            .token
            .lock()
            .map_err(|_| MetadataError::Response("token lock poisoned".to_string()))?;

        if let Some(current) = token.as_ref().filter(|t| t.expires_at > Instant::now()) {
            return Ok(current.value.clone());
        }

        let response = self
            .client
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()?
            .error_for_status()?
            .json::<TokenResponse>()?;
        log::debug!("spotify token renewed, expires in {}s", response.expires_in);

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_MARGIN);
        let value = response.access_token;
        *token = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(value)
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, MetadataError> {
        let token = self.access_token()?;
        Ok(self
            .client
            .get(format!("{API_URL}{path}"))
            .bearer_auth(token)
            .query(query)
            .send()?
            .error_for_status()?
            .json::<Value>()?)
    }
}

impl MetadataCollector for SpotifyCollector {
    fn name(&self) -> &'static str {
        "spotify"
    }

    fn fetch(&self, query: &RecordQuery) -> Result<Option<Value>, MetadataError> {
        let search = format!(
            "album:\"{}\" artist:\"{}\"",
            query.album.replace('"', ""),
            query.artist.replace('"', "")
        );
        let albums = self.get(
            "/search",
            &[("q", search.as_str()), ("type", "album"), ("limit", "1")],
        )?;
        let Some(album) = first_item(&albums, "albums")? else {
            log::debug!("spotify has no album for {query}");
            return Ok(None);
        };

        let tracks = match album.get("id").and_then(|v| v.as_str()) {
            Some(id) => self.get(&format!("/albums/{id}/tracks"), &[("limit", "50")])?,
            None => Value::Null,
        };

        let artist_search = format!("artist:\"{}\"", query.artist.replace('"', ""));
        let artists = self.get(
            "/search",
            &[("q", artist_search.as_str()), ("type", "artist"), ("limit", "1")],
        )?;
        let artist = first_item(&artists, "artists")?;

        Ok(Some(normalize(album, &tracks, artist)))
    }
}

/// First search hit of `kind` (`albums`, `artists`).
fn first_item<'a>(response: &'a Value, kind: &str) -> Result<Option<&'a Value>, MetadataError> {
    let items = response
        .get(kind)
        .and_then(|v| v.get("items"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| MetadataError::Response(format!("missing {kind}.items array")))?;
    Ok(items.first())
}

fn spotify_url(value: &Value) -> Option<&Value> {
    value.get("external_urls").and_then(|urls| urls.get("spotify"))
}

fn first_image(value: &Value) -> Option<&Value> {
    value
        .get("images")
        .and_then(|v| v.as_array())
        .and_then(|images| images.first())
        .and_then(|image| image.get("url"))
}

/// Reduce an album search hit, its track page and the artist search hit
/// to the common record shape.
pub fn normalize(album: &Value, tracks: &Value, artist: Option<&Value>) -> Value {
    let tracks: Vec<Value> = tracks
        .get("items")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|track| {
                    json!({
                        "name": track.get("name").and_then(|v| v.as_str()),
                        "duration": track
                            .get("duration_ms")
                            .and_then(|v| v.as_u64())
                            .map(|ms| (ms + 500) / 1000),
                        "explicit": track.get("explicit").and_then(|v| v.as_bool()),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let release_date = album
        .get("release_date")
        .and_then(|v| v.as_str())
        .and_then(release_month);

    let artist_name = artist
        .and_then(|a| a.get("name"))
        .or_else(|| {
            album
                .get("artists")
                .and_then(|v| v.as_array())
                .and_then(|artists| artists.first())
                .and_then(|a| a.get("name"))
        })
        .and_then(|v| v.as_str());

    json!({
        "artist": {
            "name": artist_name,
            "genres": artist
                .and_then(|a| a.get("genres"))
                .filter(|v| v.as_array().is_some_and(|g| !g.is_empty())),
            "image": artist.and_then(first_image),
            "popularity": artist.and_then(|a| a.get("popularity")),
            "url": artist.and_then(spotify_url),
        },
        "album": {
            "name": album.get("name").and_then(|v| v.as_str()),
            "image": first_image(album),
            "release_date": release_date,
            "total_tracks": album.get("total_tracks").and_then(|v| v.as_u64()),
            "tracks": tracks,
            "url": spotify_url(album),
        },
    })
}
