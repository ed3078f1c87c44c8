use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::{MetadataSourceConfig, ServerConfig};
use crate::retry::{is_retryable_status, Attempt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[serde(alias = "theaudiodb", alias = "audiodb")]
    TheAudioDb,
    #[serde(alias = "musicbrainz", alias = "mb")]
    MusicBrainz,
    Lrclib,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::TheAudioDb => "theaudiodb",
            Provider::MusicBrainz => "musicbrainz",
            Provider::Lrclib => "lrclib",
        }
    }
}

/// A failed provider call. `transient` decides whether the retry policy
/// gets another go at it.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct ProviderError {
    pub status: Option<u16>,
    pub transient: bool,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        Self {
            status: Some(status.as_u16()),
            transient: is_retryable_status(status.as_u16()),
            message: format!("http {}", status),
            retry_after,
        }
    }

    pub fn attempt<T>(&self) -> Attempt<T> {
        if self.transient {
            Attempt::Retryable {
                retry_after: self.retry_after,
            }
        } else {
            Attempt::Permanent
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ProviderError::from_status(status, None);
        }
        // DNS failures surface as connect errors.
        let transient = err.is_timeout() || err.is_connect() || err.is_request();
        Self {
            status: None,
            transient: transient && !err.is_decode() && !err.is_builder(),
            message: err.to_string(),
            retry_after: None,
        }
    }
}

/// Maps one provider call onto the retry policy's outcome. Failures are
/// logged here so fallback to the next provider stays quiet.
pub fn attempt_outcome<T>(provider: &str, result: Result<T, ProviderError>) -> Attempt<T> {
    match result {
        Ok(value) => Attempt::Success(value),
        Err(err) => {
            warn!(
                "{} request failed ({}): {}",
                provider,
                if err.transient { "transient" } else { "permanent" },
                err
            );
            err.attempt()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArtistInfo {
    pub biography: Option<String>,
    pub image_url: Option<String>,
}

impl ArtistInfo {
    pub fn is_empty(&self) -> bool {
        self.biography.is_none() && self.image_url.is_none()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LyricsQuery<'a> {
    pub title: &'a str,
    pub artist: &'a str,
    pub album: &'a str,
    pub duration_secs: u32,
}

/// A metadata source. `Ok(None)` is a miss; the caller moves on to the
/// next provider either way.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn artist_info(&self, _artist: &str) -> Result<Option<ArtistInfo>, ProviderError> {
        Ok(None)
    }

    /// URL of the album's front cover.
    async fn album_art(
        &self,
        _artist: &str,
        _album: &str,
    ) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    async fn lyrics(&self, _query: LyricsQuery<'_>) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub bytes: Vec<u8>,
    pub ext: &'static str,
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<Option<Image>, ProviderError>;
}

#[derive(Clone)]
pub struct HttpImages {
    client: Client,
    timeout: Duration,
}

impl HttpImages {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ImageFetcher for HttpImages {
    async fn fetch_image(&self, url: &str) -> Result<Option<Image>, ProviderError> {
        let response = match send(self.client.get(url).timeout(self.timeout)).await? {
            Some(response) => response,
            None => return Ok(None),
        };
        let ext = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(image_ext_from_mime)
            .or_else(|| image_ext_from_url(url))
            .unwrap_or("jpg");
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(Image {
            bytes: bytes.to_vec(),
            ext,
        }))
    }
}

/// Builds the enabled providers in configured order. Sources missing a
/// required credential are skipped with a warning.
pub fn build_providers(client: &Client, config: &ServerConfig) -> Vec<Arc<dyn MetadataProvider>> {
    let timeout = config.provider_timeout();
    let mut providers: Vec<Arc<dyn MetadataProvider>> = Vec::new();
    for source in &config.external_metadata_sources {
        if !source.enabled {
            continue;
        }
        match build_provider(client, source, timeout) {
            Some(provider) => providers.push(provider),
            None => warn!(
                "Skipping {} source: missing api_key or user_agent",
                source.provider.as_str()
            ),
        }
    }
    providers
}

fn build_provider(
    client: &Client,
    source: &MetadataSourceConfig,
    timeout: Duration,
) -> Option<Arc<dyn MetadataProvider>> {
    let api_key = source.api_key.trim();
    let user_agent = source.user_agent.trim();
    match source.provider {
        Provider::TheAudioDb if !api_key.is_empty() => Some(Arc::new(TheAudioDb {
            client: client.clone(),
            api_key: api_key.to_string(),
            timeout,
        })),
        Provider::MusicBrainz if !user_agent.is_empty() => Some(Arc::new(MusicBrainz {
            client: client.clone(),
            user_agent: user_agent.to_string(),
            timeout,
        })),
        Provider::Lrclib => Some(Arc::new(Lrclib {
            client: client.clone(),
            user_agent: (!user_agent.is_empty()).then(|| user_agent.to_string()),
            timeout,
        })),
        _ => None,
    }
}

async fn send(request: RequestBuilder) -> Result<Option<Response>, ProviderError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(Some(response));
    }
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let retry_after = retry_after(response.headers());
    Err(ProviderError::from_status(status, retry_after))
}

/// Delay-seconds form of `Retry-After`; the caller's policy caps it.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn get_json<T: DeserializeOwned>(
    request: RequestBuilder,
) -> Result<Option<T>, ProviderError> {
    match send(request).await? {
        Some(response) => Ok(Some(response.json::<T>().await?)),
        None => Ok(None),
    }
}

pub struct TheAudioDb {
    client: Client,
    api_key: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct TheAudioDbArtistResponse {
    artists: Option<Vec<TheAudioDbArtist>>,
}

#[derive(Deserialize)]
struct TheAudioDbArtist {
    #[serde(rename = "strBiographyEN")]
    bio: Option<String>,
    #[serde(rename = "strArtistThumb")]
    thumb: Option<String>,
    #[serde(rename = "strArtistFanart")]
    fanart: Option<String>,
    #[serde(rename = "strArtistWideThumb")]
    wide_thumb: Option<String>,
}

#[derive(Deserialize)]
struct TheAudioDbAlbumResponse {
    album: Option<Vec<TheAudioDbAlbum>>,
}

#[derive(Deserialize)]
struct TheAudioDbAlbum {
    #[serde(rename = "strAlbumThumb")]
    thumb: Option<String>,
    #[serde(rename = "strAlbumThumbHQ")]
    thumb_hq: Option<String>,
}

#[async_trait]
impl MetadataProvider for TheAudioDb {
    fn name(&self) -> &'static str {
        Provider::TheAudioDb.as_str()
    }

    async fn artist_info(&self, artist: &str) -> Result<Option<ArtistInfo>, ProviderError> {
        let url = format!(
            "https://www.theaudiodb.com/api/v1/json/{}/search.php?s={}",
            self.api_key,
            url_escape(artist)
        );
        let payload: Option<TheAudioDbArtistResponse> =
            get_json(self.client.get(&url).timeout(self.timeout)).await?;
        let artist = match payload.and_then(|p| p.artists).and_then(|mut items| items.pop()) {
            Some(artist) => artist,
            None => return Ok(None),
        };
        let info = ArtistInfo {
            biography: clean_text(artist.bio),
            image_url: clean_text(artist.thumb)
                .or_else(|| clean_text(artist.wide_thumb))
                .or_else(|| clean_text(artist.fanart)),
        };
        Ok((!info.is_empty()).then_some(info))
    }

    async fn album_art(&self, artist: &str, album: &str) -> Result<Option<String>, ProviderError> {
        let url = format!(
            "https://www.theaudiodb.com/api/v1/json/{}/searchalbum.php?s={}&a={}",
            self.api_key,
            url_escape(artist),
            url_escape(album)
        );
        let payload: Option<TheAudioDbAlbumResponse> =
            get_json(self.client.get(&url).timeout(self.timeout)).await?;
        Ok(payload
            .and_then(|p| p.album)
            .and_then(|mut items| items.pop())
            .and_then(|album| clean_text(album.thumb_hq).or_else(|| clean_text(album.thumb))))
    }
}

pub struct MusicBrainz {
    client: Client,
    user_agent: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct MusicBrainzReleaseGroupResponse {
    #[serde(rename = "release-groups")]
    release_groups: Option<Vec<MusicBrainzReleaseGroup>>,
}

#[derive(Deserialize)]
struct MusicBrainzReleaseGroup {
    id: String,
}

#[async_trait]
impl MetadataProvider for MusicBrainz {
    fn name(&self) -> &'static str {
        Provider::MusicBrainz.as_str()
    }

    /// Looks the release group up on MusicBrainz and points at its Cover
    /// Art Archive front image.
    async fn album_art(&self, artist: &str, album: &str) -> Result<Option<String>, ProviderError> {
        let query = format!(
            "artist:\"{}\" AND releasegroup:\"{}\"",
            lucene_escape(artist),
            lucene_escape(album)
        );
        let url = format!(
            "https://musicbrainz.org/ws/2/release-group/?query={}&fmt=json&limit=1",
            url_escape(&query)
        );
        let request = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .header("User-Agent", self.user_agent.as_str());
        let payload: Option<MusicBrainzReleaseGroupResponse> = get_json(request).await?;
        Ok(payload
            .and_then(|p| p.release_groups)
            .and_then(|groups| groups.into_iter().next())
            .map(|group| {
                format!(
                    "https://coverartarchive.org/release-group/{}/front-500",
                    group.id
                )
            }))
    }
}

pub struct Lrclib {
    client: Client,
    user_agent: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LrclibTrack {
    #[serde(default)]
    instrumental: bool,
    plain_lyrics: Option<String>,
    synced_lyrics: Option<String>,
}

#[async_trait]
impl MetadataProvider for Lrclib {
    fn name(&self) -> &'static str {
        Provider::Lrclib.as_str()
    }

    async fn lyrics(&self, query: LyricsQuery<'_>) -> Result<Option<String>, ProviderError> {
        let mut url = format!(
            "https://lrclib.net/api/get?artist_name={}&track_name={}",
            url_escape(query.artist),
            url_escape(query.title)
        );
        if !query.album.trim().is_empty() {
            url.push_str(&format!("&album_name={}", url_escape(query.album)));
        }
        if query.duration_secs > 0 {
            url.push_str(&format!("&duration={}", query.duration_secs));
        }
        let mut request = self.client.get(&url).timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            request = request.header("User-Agent", user_agent.as_str());
        }
        let track: Option<LrclibTrack> = get_json(request).await?;
        let lyrics = track.filter(|track| !track.instrumental).and_then(|track| {
            clean_text(track.synced_lyrics).or_else(|| clean_text(track.plain_lyrics))
        });
        Ok(lyrics)
    }
}

pub fn image_ext_from_mime(mime: &str) -> Option<&'static str> {
    let mime = mime.split(';').next().unwrap_or("").trim();
    match mime {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

pub fn image_ext_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("jpg"),
        "png" => Some("png"),
        "gif" => Some("gif"),
        "webp" => Some("webp"),
        _ => None,
    }
}

fn clean_text(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lucene_escape(input: &str) -> String {
    input.replace('\\', "\\\\").replace('"', "\\\"")
}

fn url_escape(input: &str) -> String {
    let mut out = String::new();
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
