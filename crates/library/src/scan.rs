use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use common::{path_key, path_string, path_within, song_id, Song};
use futures_util::stream::{self, StreamExt};
use metadata::{CoverArt, MetadataError, TagInfo};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{
    BatchCoordinator, BatchFailure, BatchFailurePolicy, BatchSink, SongUpsert, DEFAULT_BATCH_SIZE,
};
use crate::changes::{detect_changes, Coverage};
use crate::cleanup::{CleanupPlan, CleanupReport};
use crate::progress::{LogProgress, ProgressReport, ProgressSink, ScanPhase};
use crate::resolver::{EntityResolver, ResolvedEntities};
use crate::store::{now_secs, Catalog, ScanFailure};
use crate::walker::{AudioWalker, FileStat, WalkWarning};
use crate::LibraryError;

/// Tag extraction collaborator. Called from blocking worker threads.
pub trait TagReader: Send + Sync + 'static {
    fn read(&self, path: &Path) -> Result<TagInfo, MetadataError>;
}

/// Reads tags from disk with lofty.
pub struct LoftyTagReader;

impl TagReader for LoftyTagReader {
    fn read(&self, path: &Path) -> Result<TagInfo, MetadataError> {
        metadata::read_tags(path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanScope {
    /// Walk the whole folder; rows for missing files are deleted.
    Full,
    /// Walk only these files or directories under the folder. Never deletes.
    Paths(Vec<PathBuf>),
}

#[derive(Clone, Debug)]
pub struct ScanOptions {
    pub batch_size: usize,
    /// Concurrent tag reads; 0 means one per available core.
    pub workers: usize,
    /// Multi-artist separators. `None` means unconfigured and fails the scan.
    pub artist_separators: Option<Vec<String>>,
    pub failure_policy: BatchFailurePolicy,
    /// Cache root for embedded covers, written under `covers/`.
    pub cover_cache_dir: Option<PathBuf>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 0,
            artist_separators: None,
            failure_policy: BatchFailurePolicy::Continue,
            cover_cache_dir: None,
        }
    }
}

impl ScanOptions {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4)
    }
}

pub struct ScanRequest {
    pub root: PathBuf,
    pub scope: ScanScope,
    pub options: ScanOptions,
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressSink>,
    pub tag_reader: Arc<dyn TagReader>,
    /// Where batches are committed; the scanned catalog when `None`.
    pub batch_sink: Option<Arc<dyn BatchSink>>,
}

impl ScanRequest {
    pub fn full(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into(), ScanScope::Full)
    }

    pub fn paths(root: impl Into<PathBuf>, paths: Vec<PathBuf>) -> Self {
        Self::new(root.into(), ScanScope::Paths(paths))
    }

    fn new(root: PathBuf, scope: ScanScope) -> Self {
        Self {
            root,
            scope,
            options: ScanOptions::default(),
            cancel: CancellationToken::new(),
            progress: Arc::new(LogProgress),
            tag_reader: Arc::new(LoftyTagReader),
            batch_sink: None,
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_tag_reader(mut self, reader: Arc<dyn TagReader>) -> Self {
        self.tag_reader = reader;
        self
    }

    pub fn with_batch_sink(mut self, sink: Arc<dyn BatchSink>) -> Self {
        self.batch_sink = Some(sink);
        self
    }

    pub fn is_full(&self) -> bool {
        self.scope == ScanScope::Full
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    InProgress,
    Complete,
    CompleteWithErrors,
    Cancelled,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::InProgress => "in_progress",
            ScanStatus::Complete => "complete",
            ScanStatus::CompleteWithErrors => "complete_with_errors",
            ScanStatus::Cancelled => "cancelled",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanStatus::InProgress)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounts {
    pub discovered: usize,
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Missing rows a targeted scan saw but left alone.
    pub deferred_removals: usize,
    pub failed: usize,
    pub committed: usize,
    pub unattempted: usize,
    pub artists_created: usize,
    pub albums_created: usize,
    pub genres_created: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanOutcome {
    pub root: String,
    pub folder_id: Option<String>,
    pub full: bool,
    pub status: ScanStatus,
    pub counts: ScanCounts,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub failures: Vec<FileFailure>,
    pub batch_failures: Vec<BatchFailure>,
    pub cleanup: Option<CleanupReport>,
    pub walk_warnings: Vec<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ScanOutcome {
    fn new(root: &Path, full: bool) -> Self {
        Self {
            root: path_string(root),
            folder_id: None,
            full,
            status: ScanStatus::InProgress,
            counts: ScanCounts::default(),
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
            failures: Vec::new(),
            batch_failures: Vec::new(),
            cleanup: None,
            walk_warnings: Vec::new(),
            error: None,
            elapsed_ms: 0,
        }
    }
}

struct Extraction {
    tags: TagInfo,
    cover_path: Option<String>,
}

/// Runs one scan to a terminal status. Errors are folded into the
/// outcome; this never fails outright.
pub async fn run_scan(catalog: Catalog, request: ScanRequest) -> ScanOutcome {
    let started = Instant::now();
    let mut outcome = ScanOutcome::new(&request.root, request.is_full());

    match scan_folder(&catalog, &request, &mut outcome).await {
        Ok(status) => outcome.status = status,
        Err(err) => {
            warn!("Scan of {} failed: {}", outcome.root, err);
            outcome.status = ScanStatus::Failed;
            outcome.error = Some(err.to_string());
        }
    }
    outcome.elapsed_ms = started.elapsed().as_millis() as u64;

    info!(
        "Scan of {} {} in {} ms: {} added, {} modified, {} removed, {} failed",
        outcome.root,
        outcome.status.as_str(),
        outcome.elapsed_ms,
        outcome.counts.added,
        outcome.counts.modified,
        outcome.counts.removed,
        outcome.counts.failed
    );
    request.progress.report(&ProgressReport::new(
        ScanPhase::Finished,
        outcome.counts.committed,
        outcome.counts.added + outcome.counts.modified,
        outcome.status.as_str(),
    ));
    outcome
}

async fn scan_folder(
    catalog: &Catalog,
    request: &ScanRequest,
    outcome: &mut ScanOutcome,
) -> Result<ScanStatus, LibraryError> {
    let separators = request.options.artist_separators.clone().ok_or_else(|| {
        LibraryError::Configuration("artist separators are not configured".to_string())
    })?;
    if !request.root.is_dir() {
        return Err(LibraryError::Configuration(format!(
            "music root {} is not a directory",
            request.root.display()
        )));
    }

    let full = request.is_full();
    let targets: Vec<PathBuf> = match &request.scope {
        ScanScope::Full => vec![request.root.clone()],
        ScanScope::Paths(paths) => paths
            .iter()
            .filter(|path| {
                let inside = path_within(path, &request.root);
                if !inside {
                    warn!(
                        "Ignoring {} outside {}",
                        path.display(),
                        request.root.display()
                    );
                }
                inside
            })
            .cloned()
            .collect(),
    };

    let root = request.root.clone();
    let folder = blocking(catalog, move |catalog| catalog.ensure_folder(&root)).await?;
    outcome.folder_id = Some(folder.id.clone());

    let progress = Arc::clone(&request.progress);
    progress.report(&ProgressReport::new(
        ScanPhase::Walking,
        0,
        0,
        format!("walking {}", outcome.root),
    ));

    let walk_roots: Vec<PathBuf> = targets.iter().filter(|path| path.exists()).cloned().collect();
    let cancel = request.cancel.clone();
    let (files, warnings) = tokio::task::spawn_blocking(move || walk_files(&walk_roots, &cancel))
        .await
        .map_err(|err| LibraryError::Join(err.to_string()))?;
    // A warning without a path leaves no way to tell what was missed.
    let unreadable: Vec<PathBuf> = warnings
        .iter()
        .map(|warning| warning.path.clone().unwrap_or_else(|| request.root.clone()))
        .collect();
    outcome.walk_warnings = warnings
        .into_iter()
        .map(|warning| match warning.path {
            Some(path) => format!("{}: {}", path.display(), warning.message),
            None => warning.message,
        })
        .collect();
    if request.cancel.is_cancelled() {
        return Ok(ScanStatus::Cancelled);
    }
    outcome.counts.discovered = files.len();

    let folder_id = folder.id.clone();
    let snapshot = blocking(catalog, move |catalog| catalog.folder_snapshot(&folder_id)).await?;
    let scope = if full {
        Coverage::folder()
    } else {
        Coverage::paths(&targets)
    };
    let changes = detect_changes(files, snapshot, scope.skipping(&unreadable));

    outcome.counts.added = changes.added.len();
    outcome.counts.modified = changes.modified.len();
    outcome.counts.unchanged = changes.unchanged.len();
    outcome.added = changes.added.iter().map(|f| path_string(&f.path)).collect();
    outcome.modified = changes.modified.iter().map(|f| path_string(&f.path)).collect();
    if full {
        outcome.counts.removed = changes.removed.len();
        outcome.removed = changes.removed.iter().map(|s| s.path.clone()).collect();
    } else {
        outcome.counts.deferred_removals = changes.removed.len();
    }
    progress.report(&ProgressReport::new(
        ScanPhase::Detecting,
        outcome.counts.discovered,
        outcome.counts.discovered,
        format!(
            "{} added, {} modified, {} unchanged, {} missing",
            changes.added.len(),
            changes.modified.len(),
            changes.unchanged.len(),
            changes.removed.len()
        ),
    ));

    let index = blocking(catalog, |catalog| catalog.entity_index()).await?;
    let mut resolver = EntityResolver::new(index, &separators);

    let to_extract: Vec<FileStat> = changes.to_extract().cloned().collect();
    let extracted_paths: Vec<String> = to_extract.iter().map(|f| path_string(&f.path)).collect();
    let total = to_extract.len();

    let sink: Arc<dyn BatchSink> = match &request.batch_sink {
        Some(sink) => Arc::clone(sink),
        None => Arc::new(catalog.clone()),
    };
    let mut coordinator = BatchCoordinator::new(sink, request.options.batch_size, total)
        .with_policy(request.options.failure_policy)
        .with_progress(Arc::clone(&progress))
        .with_cancel(request.cancel.clone());

    let reader = Arc::clone(&request.tag_reader);
    let covers = request.options.cover_cache_dir.clone();
    let mut extractions = stream::iter(to_extract.into_iter().map(move |stat| {
        let reader = Arc::clone(&reader);
        let covers = covers.clone();
        async move {
            let path = stat.path.clone();
            let result = tokio::task::spawn_blocking(move || {
                extract(reader.as_ref(), &path, covers.as_deref())
            })
            .await;
            (stat, result)
        }
    }))
    .buffered(request.options.worker_count());

    let now = now_secs();
    let mut cancelled = false;
    while let Some((stat, result)) = extractions.next().await {
        if request.cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        let extraction = match result {
            Ok(Ok(extraction)) => extraction,
            Ok(Err(err)) => {
                warn!("Failed to read tags for {:?}: {}", stat.path, err);
                outcome.failures.push(FileFailure {
                    path: path_string(&stat.path),
                    reason: err.to_string(),
                });
                continue;
            }
            Err(err) => {
                warn!("Tag reader for {:?} did not finish: {}", stat.path, err);
                outcome.failures.push(FileFailure {
                    path: path_string(&stat.path),
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let fallback = album_fallback(&stat.path, &request.root);
        let resolved = resolver.resolve(&extraction.tags, fallback.as_deref());
        let song = build_song(&folder.id, &stat, extraction, &resolved, now);
        coordinator
            .push(SongUpsert {
                song,
                entities: resolved.rows,
            })
            .await;
    }
    drop(extractions);

    let summary = if cancelled {
        coordinator.abandon()
    } else {
        coordinator.finish().await
    };

    let created = resolver.counts();
    outcome.counts.failed = outcome.failures.len();
    outcome.counts.committed = summary.committed_songs;
    outcome.counts.unattempted = summary.unattempted_songs;
    outcome.counts.artists_created = created.artists_created;
    outcome.counts.albums_created = created.albums_created;
    outcome.counts.genres_created = created.genres_created;
    outcome.batch_failures = summary.failures;

    if cancelled || summary.cancelled || request.cancel.is_cancelled() {
        info!(
            "Scan of {} cancelled after {} committed songs",
            outcome.root, summary.committed_songs
        );
        return Ok(ScanStatus::Cancelled);
    }

    progress.report(&ProgressReport::new(
        ScanPhase::Cleanup,
        outcome.counts.committed,
        total,
        format!("removing {} missing songs", outcome.counts.removed),
    ));
    let plan = CleanupPlan {
        folder_id: folder.id.clone(),
        removed_song_ids: if full {
            changes.removed.iter().map(|s| s.song_id.clone()).collect()
        } else {
            Vec::new()
        },
        failures: outcome
            .failures
            .iter()
            .map(|failure| ScanFailure {
                folder_id: folder.id.clone(),
                path: failure.path.clone(),
                reason: failure.reason.clone(),
                last_seen: now,
            })
            .collect(),
        replace_failures: full,
        rescanned_paths: if full { Vec::new() } else { extracted_paths },
        mark_scanned: full,
    };
    match blocking(catalog, move |catalog| catalog.run_cleanup(&plan)).await {
        Ok(report) => outcome.cleanup = Some(report),
        Err(err) => {
            warn!("Cleanup for {} failed: {}", outcome.root, err);
            outcome.error = Some(format!("cleanup failed: {}", err));
        }
    }

    if outcome.error.is_some()
        || !outcome.failures.is_empty()
        || !outcome.batch_failures.is_empty()
        || !outcome.walk_warnings.is_empty()
    {
        Ok(ScanStatus::CompleteWithErrors)
    } else {
        Ok(ScanStatus::Complete)
    }
}

fn walk_files(roots: &[PathBuf], cancel: &CancellationToken) -> (Vec<FileStat>, Vec<WalkWarning>) {
    let walker = AudioWalker::new(roots.iter().cloned());
    let mut files = walker.files();
    let mut found = Vec::new();
    for file in files.by_ref() {
        if cancel.is_cancelled() {
            break;
        }
        found.push(file);
    }
    (found, files.take_warnings())
}

fn extract(
    reader: &dyn TagReader,
    path: &Path,
    covers: Option<&Path>,
) -> Result<Extraction, MetadataError> {
    let mut tags = reader.read(path)?;
    let cover = tags.cover.take();
    let cover_path = match (cover, covers) {
        (Some(cover), Some(dir)) => match store_cover(dir, &cover) {
            Ok(stored) => Some(path_string(&stored)),
            Err(err) => {
                warn!("Failed to cache cover for {:?}: {}", path, err);
                None
            }
        },
        _ => None,
    };
    Ok(Extraction { tags, cover_path })
}

/// Writes embedded cover bytes to `<cache>/covers/<blake3>.<ext>`. Repeat
/// writes of the same image return the existing file.
pub fn store_cover(cache_dir: &Path, cover: &CoverArt) -> std::io::Result<PathBuf> {
    let hash = blake3::hash(&cover.data).to_hex().to_string();
    let dir = cache_dir.join("covers");
    let path = dir.join(format!("{}.{}", hash, cover.extension()));
    if path.exists() {
        return Ok(path);
    }
    fs::create_dir_all(&dir)?;
    let partial = dir.join(format!(
        ".{}-{:?}.part",
        hash,
        std::thread::current().id()
    ));
    fs::write(&partial, &cover.data)?;
    fs::rename(&partial, &path)?;
    Ok(path)
}

/// Parent directory name, unless the file sits directly in the root.
fn album_fallback(path: &Path, root: &Path) -> Option<String> {
    let parent = path.parent()?;
    if path_key(parent) == path_key(root) {
        return None;
    }
    parent
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| path_string(path))
}

fn build_song(
    folder_id: &str,
    stat: &FileStat,
    extraction: Extraction,
    resolved: &ResolvedEntities,
    now: u64,
) -> Song {
    let tags = extraction.tags;
    Song {
        id: song_id(&stat.path),
        path: path_string(&stat.path),
        folder_id: folder_id.to_string(),
        title: tags.title.unwrap_or_else(|| file_stem(&stat.path)),
        artist_id: resolved.artist_id.clone(),
        featured_artist_ids: resolved.featured_artist_ids.clone(),
        album_id: resolved.album_id.clone(),
        genre_ids: resolved.genre_ids.clone(),
        duration_ms: tags.duration_ms.unwrap_or(0),
        track_no: tags.track_no,
        disc_no: tags.disc_no,
        year: tags.year,
        bitrate: tags.bitrate,
        sample_rate: tags.sample_rate,
        channels: tags.channels,
        modified_ms: stat.modified_ms,
        file_size: stat.size,
        added_at: now,
        play_count: 0,
        last_played: None,
        cover_art_path: extraction.cover_path,
        lyrics_path: None,
        lyrics_checked_at: None,
    }
}

async fn blocking<T, F>(catalog: &Catalog, work: F) -> Result<T, LibraryError>
where
    T: Send + 'static,
    F: FnOnce(&Catalog) -> Result<T, LibraryError> + Send + 'static,
{
    let catalog = catalog.clone();
    tokio::task::spawn_blocking(move || work(&catalog))
        .await
        .map_err(|err| LibraryError::Join(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn album_falls_back_to_parent_directory() {
        let root = Path::new("/music");
        assert_eq!(
            album_fallback(Path::new("/music/Artist/Record/01.mp3"), root),
            Some("Record".to_string())
        );
        assert_eq!(album_fallback(Path::new("/music/01.mp3"), root), None);
    }

    #[test]
    fn covers_are_cached_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let cover = CoverArt {
            data: vec![0x89, 0x50, 0x4E, 0x47, 1, 2, 3],
            mime: Some("image/png".to_string()),
        };
        let first = store_cover(dir.path(), &cover).unwrap();
        let second = store_cover(dir.path(), &cover).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.extension().unwrap(), "png");
        assert!(first.starts_with(dir.path().join("covers")));
        assert_eq!(fs::read(&first).unwrap(), cover.data);
        assert_eq!(fs::read_dir(dir.path().join("covers")).unwrap().count(), 1);
    }

    #[test]
    fn worker_count_defaults_to_cores() {
        let options = ScanOptions::default();
        assert!(options.worker_count() >= 1);
        let options = ScanOptions {
            workers: 3,
            ..ScanOptions::default()
        };
        assert_eq!(options.worker_count(), 3);
    }
}
