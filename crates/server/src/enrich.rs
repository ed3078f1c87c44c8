use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{path_string, Album, Artist, Song};
use library::store::now_secs;
use library::{ArtistEnrichment, Catalog, LibraryError};
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::external::{
    attempt_outcome, ArtistInfo, Image, ImageFetcher, LyricsQuery, MetadataProvider,
};
use crate::retry::{Cancelled, RetryPolicy};

const IMAGE_EXTS: [&str; 4] = ["jpg", "png", "gif", "webp"];
const SWEEP_PAGE: usize = 200;

#[derive(Clone, Debug)]
pub struct EnrichSettings {
    pub enabled: bool,
    /// Entities checked more recently than this are skipped.
    pub min_interval: Duration,
    /// Lookups per sweep; 0 means no limit.
    pub scan_limit: usize,
    pub retry: RetryPolicy,
    pub cache_dir: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub artists_checked: usize,
    pub artists_updated: usize,
    pub albums_checked: usize,
    pub albums_updated: usize,
    pub songs_checked: usize,
    pub lyrics_found: usize,
    pub cancelled: bool,
}

/// Fills missing biographies, images, album art and lyrics from the
/// configured providers, in order, caching results under `cache_dir`.
#[derive(Clone)]
pub struct Enricher {
    catalog: Catalog,
    providers: Arc<Vec<Arc<dyn MetadataProvider>>>,
    images: Arc<dyn ImageFetcher>,
    settings: EnrichSettings,
}

impl Enricher {
    pub fn new(
        catalog: Catalog,
        providers: Vec<Arc<dyn MetadataProvider>>,
        images: Arc<dyn ImageFetcher>,
        settings: EnrichSettings,
    ) -> Self {
        Self {
            catalog,
            providers: Arc::new(providers),
            images,
            settings,
        }
    }

    pub fn is_active(&self) -> bool {
        self.settings.enabled && !self.providers.is_empty()
    }

    fn cooled_down(&self, checked_at: Option<u64>, now: u64) -> bool {
        match checked_at {
            Some(checked) => now.saturating_sub(checked) >= self.settings.min_interval.as_secs(),
            None => true,
        }
    }

    pub fn needs_artist(&self, artist: &Artist, now: u64) -> bool {
        (artist.biography.is_none() || artist.image_path.is_none())
            && self.cooled_down(artist.metadata_checked_at, now)
    }

    pub fn needs_album(&self, album: &Album, now: u64) -> bool {
        album.art_path.is_none() && self.cooled_down(album.art_checked_at, now)
    }

    pub fn needs_lyrics(&self, song: &Song, now: u64) -> bool {
        song.lyrics_path.is_none() && self.cooled_down(song.lyrics_checked_at, now)
    }

    /// Returns whether any field was filled. The checked timestamp is
    /// written either way so the cooldown applies to misses too.
    pub async fn enrich_artist(
        &self,
        artist: &Artist,
        cancel: &CancellationToken,
    ) -> Result<bool, Cancelled> {
        let mut update = ArtistEnrichment::default();
        let mut image_path = match artist.image_path {
            Some(_) => None,
            None => cached_file(&self.settings.cache_dir.join("artists"), &artist.id).await,
        };
        let mut image_url: Option<String> = None;
        let mut have_bio = artist.biography.is_some();
        let mut unsaved = false;

        for provider in self.providers.iter() {
            let have_image =
                artist.image_path.is_some() || image_path.is_some() || image_url.is_some();
            if have_bio && have_image {
                break;
            }
            let label = format!("{} artist '{}'", provider.name(), artist.name);
            let info = self
                .settings
                .retry
                .run(&label, cancel, |_| async move {
                    attempt_outcome(provider.name(), provider.artist_info(&artist.name).await)
                })
                .await?
                .flatten();
            let ArtistInfo {
                biography,
                image_url: url,
            } = match info {
                Some(info) => info,
                None => continue,
            };
            if !have_bio && biography.is_some() {
                update.biography = biography;
                have_bio = true;
            }
            if image_url.is_none() {
                image_url = url;
            }
        }

        if artist.image_path.is_none() && image_path.is_none() {
            if let Some(url) = image_url.as_deref() {
                match self.download(url, "artists", &artist.id, cancel).await? {
                    Fetched::Saved(path) => image_path = Some(path),
                    Fetched::Missing => {}
                    Fetched::Unsaved => unsaved = true,
                }
            }
        }
        update.image_path = image_path.map(|path| path_string(&path));

        let updated = update.biography.is_some() || update.image_path.is_some();
        let checked_at = (!unsaved).then(now_secs);
        let catalog = self.catalog.clone();
        let id = artist.id.clone();
        let stored =
            blocking(move || catalog.update_artist_enrichment(&id, update, checked_at)).await;
        if let Err(err) = stored {
            warn!("Failed to store enrichment for artist {}: {}", artist.name, err);
            return Ok(false);
        }
        Ok(updated)
    }

    pub async fn enrich_album(
        &self,
        album: &Album,
        artist_name: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, Cancelled> {
        let dir = self.settings.cache_dir.join("albums");
        let mut art_path = cached_file(&dir, &album.id).await;
        let mut art_url: Option<String> = None;
        let mut unsaved = false;

        if art_path.is_none() {
            for provider in self.providers.iter() {
                let label = format!("{} album '{}'", provider.name(), album.title);
                let url = self
                    .settings
                    .retry
                    .run(&label, cancel, |_| async move {
                        attempt_outcome(
                            provider.name(),
                            provider.album_art(artist_name, &album.title).await,
                        )
                    })
                    .await?
                    .flatten();
                let url = match url {
                    Some(url) => url,
                    None => continue,
                };
                let fetched = self.download(&url, "albums", &album.id, cancel).await?;
                art_url = Some(url);
                match fetched {
                    Fetched::Saved(path) => {
                        art_path = Some(path);
                        break;
                    }
                    Fetched::Missing => {}
                    Fetched::Unsaved => unsaved = true,
                }
            }
        }

        let updated = art_path.is_some();
        // Art that was found but not written stays due for the next sweep.
        let checked_at = (updated || !unsaved).then(now_secs);
        let catalog = self.catalog.clone();
        let id = album.id.clone();
        let art_path = art_path.map(|path| path_string(&path));
        let stored =
            blocking(move || catalog.update_album_art(&id, art_path, art_url, checked_at)).await;
        if let Err(err) = stored {
            warn!("Failed to store art for album {}: {}", album.title, err);
            return Ok(false);
        }
        Ok(updated)
    }

    pub async fn enrich_lyrics(
        &self,
        song: &Song,
        artist_name: &str,
        album_title: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, Cancelled> {
        let dir = self.settings.cache_dir.join("lyrics");
        let target = dir.join(format!("{}.lrc", song.id));
        let mut lyrics_path = tokio::fs::metadata(&target).await.ok().map(|_| target.clone());
        let mut unsaved = false;

        if lyrics_path.is_none() {
            let query = LyricsQuery {
                title: &song.title,
                artist: artist_name,
                album: album_title,
                duration_secs: song.duration_ms / 1000,
            };
            for provider in self.providers.iter() {
                let label = format!("{} lyrics '{}'", provider.name(), song.title);
                let lyrics = self
                    .settings
                    .retry
                    .run(&label, cancel, |_| async move {
                        attempt_outcome(provider.name(), provider.lyrics(query).await)
                    })
                    .await?
                    .flatten();
                if let Some(text) = lyrics {
                    match write_cache_file(&dir, &target, text.as_bytes()).await {
                        Ok(()) => lyrics_path = Some(target.clone()),
                        Err(err) => {
                            warn!("Failed to cache lyrics for {}: {}", song.title, err);
                            unsaved = true;
                        }
                    }
                    break;
                }
            }
        }

        let updated = lyrics_path.is_some();
        let checked_at = (updated || !unsaved).then(now_secs);
        let catalog = self.catalog.clone();
        let id = song.id.clone();
        let lyrics_path = lyrics_path.map(|path| path_string(&path));
        let stored =
            blocking(move || catalog.update_song_lyrics(&id, lyrics_path, checked_at)).await;
        if let Err(err) = stored {
            warn!("Failed to store lyrics for {}: {}", song.title, err);
            return Ok(false);
        }
        Ok(updated)
    }

    /// Pages through the catalog and enriches whatever is due, stopping at
    /// the lookup limit. Enrichment failures never fail the sweep.
    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<EnrichReport, LibraryError> {
        let mut report = EnrichReport::default();
        if !self.is_active() {
            return Ok(report);
        }
        let limit = if self.settings.scan_limit == 0 {
            usize::MAX
        } else {
            self.settings.scan_limit
        };
        let mut remaining = limit;
        let now = now_secs();

        match self.sweep_artists(cancel, now, &mut remaining, &mut report).await? {
            Ok(()) => {}
            Err(Cancelled) => return Ok(cancelled(report)),
        }
        match self.sweep_albums(cancel, now, &mut remaining, &mut report).await? {
            Ok(()) => {}
            Err(Cancelled) => return Ok(cancelled(report)),
        }
        match self.sweep_songs(cancel, now, &mut remaining, &mut report).await? {
            Ok(()) => {}
            Err(Cancelled) => return Ok(cancelled(report)),
        }

        info!(
            "Enrichment sweep finished: {}/{} artists, {}/{} albums, {}/{} lyrics",
            report.artists_updated,
            report.artists_checked,
            report.albums_updated,
            report.albums_checked,
            report.lyrics_found,
            report.songs_checked
        );
        Ok(report)
    }

    async fn sweep_artists(
        &self,
        cancel: &CancellationToken,
        now: u64,
        remaining: &mut usize,
        report: &mut EnrichReport,
    ) -> Result<Result<(), Cancelled>, LibraryError> {
        let mut offset = 0;
        while *remaining > 0 {
            let catalog = self.catalog.clone();
            let (page, total) =
                blocking(move || catalog.list_artists(None, SWEEP_PAGE, offset)).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for artist in page.iter().filter(|artist| self.needs_artist(artist, now)) {
                if *remaining == 0 {
                    break;
                }
                *remaining -= 1;
                report.artists_checked += 1;
                match self.enrich_artist(artist, cancel).await {
                    Ok(true) => report.artists_updated += 1,
                    Ok(false) => {}
                    Err(Cancelled) => return Ok(Err(Cancelled)),
                }
            }
            if offset >= total {
                break;
            }
        }
        Ok(Ok(()))
    }

    async fn sweep_albums(
        &self,
        cancel: &CancellationToken,
        now: u64,
        remaining: &mut usize,
        report: &mut EnrichReport,
    ) -> Result<Result<(), Cancelled>, LibraryError> {
        let mut offset = 0;
        while *remaining > 0 {
            let catalog = self.catalog.clone();
            let (page, total) =
                blocking(move || catalog.list_albums(None, SWEEP_PAGE, offset)).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for album in page.iter().filter(|album| self.needs_album(album, now)) {
                if *remaining == 0 {
                    break;
                }
                *remaining -= 1;
                report.albums_checked += 1;
                let artist_name = self.artist_name(&album.artist_id).await?;
                match self.enrich_album(album, &artist_name, cancel).await {
                    Ok(true) => report.albums_updated += 1,
                    Ok(false) => {}
                    Err(Cancelled) => return Ok(Err(Cancelled)),
                }
            }
            if offset >= total {
                break;
            }
        }
        Ok(Ok(()))
    }

    async fn sweep_songs(
        &self,
        cancel: &CancellationToken,
        now: u64,
        remaining: &mut usize,
        report: &mut EnrichReport,
    ) -> Result<Result<(), Cancelled>, LibraryError> {
        let mut offset = 0;
        while *remaining > 0 {
            let catalog = self.catalog.clone();
            let (page, total) =
                blocking(move || catalog.list_songs(None, SWEEP_PAGE, offset)).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for song in page.iter().filter(|song| self.needs_lyrics(song, now)) {
                if *remaining == 0 {
                    break;
                }
                *remaining -= 1;
                report.songs_checked += 1;
                let artist_name = self.artist_name(&song.artist_id).await?;
                let album_title = self.album_title(&song.album_id).await?;
                match self.enrich_lyrics(song, &artist_name, &album_title, cancel).await {
                    Ok(true) => report.lyrics_found += 1,
                    Ok(false) => {}
                    Err(Cancelled) => return Ok(Err(Cancelled)),
                }
            }
            if offset >= total {
                break;
            }
        }
        Ok(Ok(()))
    }

    async fn artist_name(&self, artist_id: &str) -> Result<String, LibraryError> {
        let catalog = self.catalog.clone();
        let id = artist_id.to_string();
        let artist = blocking(move || catalog.get_artist(&id)).await?;
        Ok(artist.map(|artist| artist.name).unwrap_or_default())
    }

    async fn album_title(&self, album_id: &str) -> Result<String, LibraryError> {
        let catalog = self.catalog.clone();
        let id = album_id.to_string();
        let album = blocking(move || catalog.get_album(&id)).await?;
        Ok(album.map(|album| album.title).unwrap_or_default())
    }

    async fn download(
        &self,
        url: &str,
        kind: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Fetched, Cancelled> {
        let label = format!("image {}", url);
        let image: Option<Image> = self
            .settings
            .retry
            .run(&label, cancel, |_| async move {
                attempt_outcome("image", self.images.fetch_image(url).await)
            })
            .await?
            .flatten();
        let image = match image {
            Some(image) => image,
            None => return Ok(Fetched::Missing),
        };
        let dir = self.settings.cache_dir.join(kind);
        let path = dir.join(format!("{}.{}", id, image.ext));
        match write_cache_file(&dir, &path, &image.bytes).await {
            Ok(()) => {
                debug!("Cached {} image {}", kind, path.display());
                Ok(Fetched::Saved(path))
            }
            Err(err) => {
                warn!("Failed to cache image {}: {}", path.display(), err);
                Ok(Fetched::Unsaved)
            }
        }
    }
}

/// Result of fetching and caching one image.
enum Fetched {
    Saved(PathBuf),
    Missing,
    /// Found, but the cache write failed.
    Unsaved,
}

fn cancelled(mut report: EnrichReport) -> EnrichReport {
    report.cancelled = true;
    info!("Enrichment sweep cancelled");
    report
}

/// An existing cache entry for `id` in any image format.
async fn cached_file(dir: &Path, id: &str) -> Option<PathBuf> {
    for ext in IMAGE_EXTS {
        let path = dir.join(format!("{}.{}", id, ext));
        if tokio::fs::metadata(&path).await.is_ok() {
            return Some(path);
        }
    }
    None
}

async fn write_cache_file(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = dir.to_path_buf();
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || persist_cache_file(&dir, &path, &bytes))
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}

/// Writes through a uniquely named temp file in `dir`, so concurrent
/// writers of the same entry never share a partial file.
fn persist_cache_file(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

async fn blocking<T, F>(work: F) -> Result<T, LibraryError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LibraryError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| LibraryError::Join(err.to_string()))?
}
