use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{path_key, path_string, Album, Artist, Folder, Genre, Song};
use parking_lot::Mutex;
use redb::{CommitError, DatabaseError, StorageError, TableError, TransactionError};
use thiserror::Error;
use tracing::info;

pub mod batch;
pub mod changes;
pub mod cleanup;
pub mod progress;
pub mod resolver;
pub mod scan;
pub mod store;
pub mod walker;

pub use batch::{BatchFailure, BatchFailurePolicy, BatchSink, SongUpsert, DEFAULT_BATCH_SIZE};
pub use cleanup::CleanupReport;
pub use progress::{LogProgress, ProgressReport, ProgressSink, ScanPhase};
pub use scan::{
    run_scan, FileFailure, LoftyTagReader, ScanCounts, ScanOptions, ScanOutcome, ScanRequest,
    ScanScope, ScanStatus, TagReader,
};
pub use store::{ArtistEnrichment, Catalog, CatalogStats, ScanFailure};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("db error: {0}")]
    Redb(#[from] redb::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
    #[error("key parse error: {0}")]
    KeyParse(String),
    #[error("a scan of {0} is already running")]
    ScanInProgress(String),
    #[error("folder {0} still owns {1} songs")]
    FolderNotEmpty(String, usize),
    #[error("folder {0} is not registered")]
    FolderNotFound(String),
    #[error("background task failed: {0}")]
    Join(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

/// A running scan, as seen from outside.
#[derive(Clone, Debug)]
pub struct ActiveScan {
    pub root: PathBuf,
    pub full: bool,
}

type ScanRegistry = Arc<Mutex<HashMap<String, ActiveScan>>>;

/// Holds a folder's scan slot; released on drop.
pub struct ScanGuard {
    key: String,
    registry: ScanRegistry,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// The catalog plus the bookkeeping that keeps scans of one folder from
/// overlapping.
#[derive(Clone)]
pub struct Library {
    catalog: Catalog,
    scans: ScanRegistry,
}

impl Library {
    pub fn open(db_path: &Path) -> Result<Self, LibraryError> {
        let catalog = Catalog::open(db_path)?;
        let stats = catalog.stats()?;
        info!(
            "Opened catalog {} ({} songs, {} artists, {} albums)",
            db_path.display(),
            stats.songs,
            stats.artists,
            stats.albums
        );
        Ok(Self::with_catalog(catalog))
    }

    pub fn with_catalog(catalog: Catalog) -> Self {
        Self {
            catalog,
            scans: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Claims the scan slot for `root`. A second claim while the first
    /// guard lives is rejected, not queued.
    pub fn begin_scan(&self, root: &Path, full: bool) -> Result<ScanGuard, LibraryError> {
        let key = path_key(root);
        let mut scans = self.scans.lock();
        if scans.contains_key(&key) {
            return Err(LibraryError::ScanInProgress(path_string(root)));
        }
        scans.insert(
            key.clone(),
            ActiveScan {
                root: root.to_path_buf(),
                full,
            },
        );
        Ok(ScanGuard {
            key,
            registry: Arc::clone(&self.scans),
        })
    }

    pub fn is_scanning(&self, root: &Path) -> bool {
        self.scans.lock().contains_key(&path_key(root))
    }

    pub fn active_scans(&self) -> Vec<ActiveScan> {
        let mut scans: Vec<ActiveScan> = self.scans.lock().values().cloned().collect();
        scans.sort_by(|a, b| a.root.cmp(&b.root));
        scans
    }

    pub async fn scan(&self, request: ScanRequest) -> Result<ScanOutcome, LibraryError> {
        let guard = self.begin_scan(&request.root, request.is_full())?;
        let outcome = run_scan(self.catalog.clone(), request).await;
        drop(guard);
        Ok(outcome)
    }

    pub fn remove_folder(&self, root: &Path, cascade: bool) -> Result<CleanupReport, LibraryError> {
        let _guard = self.begin_scan(root, true)?;
        self.catalog.remove_folder(root, cascade)
    }

    pub fn list_folders(&self) -> Result<Vec<Folder>, LibraryError> {
        self.catalog.list_folders()
    }

    pub fn stats(&self) -> Result<CatalogStats, LibraryError> {
        self.catalog.stats()
    }

    pub fn list_songs(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Song>, usize), LibraryError> {
        self.catalog.list_songs(search, limit, offset)
    }

    pub fn list_artists(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Artist>, usize), LibraryError> {
        self.catalog.list_artists(search, limit, offset)
    }

    pub fn list_albums(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Album>, usize), LibraryError> {
        self.catalog.list_albums(search, limit, offset)
    }

    pub fn list_genres(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Genre>, usize), LibraryError> {
        self.catalog.list_genres(search, limit, offset)
    }

    pub fn get_song(&self, song_id: &str) -> Result<Option<Song>, LibraryError> {
        self.catalog.get_song(song_id)
    }

    pub fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>, LibraryError> {
        self.catalog.get_artist(artist_id)
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, LibraryError> {
        self.catalog.get_album(album_id)
    }

    pub fn record_play(&self, song_id: &str) -> Result<bool, LibraryError> {
        self.catalog.record_play(song_id)
    }

    pub fn list_scan_failures(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<ScanFailure>, usize), LibraryError> {
        self.catalog.list_scan_failures(limit, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> (tempfile::TempDir, Library) {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("catalog.redb")).unwrap();
        (dir, library)
    }

    #[test]
    fn scan_slot_is_exclusive_per_folder() {
        let (dir, library) = library();
        let root = dir.path().join("music");
        let other = dir.path().join("other");

        let guard = library.begin_scan(&root, true).unwrap();
        assert!(matches!(
            library.begin_scan(&root, false),
            Err(LibraryError::ScanInProgress(_))
        ));
        let _other = library.begin_scan(&other, true).unwrap();
        assert_eq!(library.active_scans().len(), 2);

        drop(guard);
        assert!(!library.is_scanning(&root));
        assert!(library.begin_scan(&root, true).is_ok());
    }

    #[test]
    fn record_play_ignores_unknown_songs() {
        let (_dir, library) = library();
        assert!(!library.record_play("missing").unwrap());
    }

    #[test]
    fn removing_unknown_folder_fails() {
        let (dir, library) = library();
        assert!(matches!(
            library.remove_folder(&dir.path().join("nowhere"), true),
            Err(LibraryError::FolderNotFound(_))
        ));
    }
}
