use std::collections::HashSet;
use std::path::Path;

use common::{normalize_name, path_key, Album, Artist, Folder, Genre, Song};
use redb::{ReadableTable, WriteTransaction};
use serde::Serialize;
use tracing::{debug, info};

use crate::store::{
    album_key, decode_value, encode_value, failure_key, folder_song_key, now_secs, prefix_key,
    Catalog, RowTable, ScanFailure, ALBUMS_BY_KEY_TABLE, ALBUMS_TABLE, ARTISTS_BY_NAME_TABLE,
    ARTISTS_TABLE, FOLDERS_BY_PATH_TABLE, FOLDERS_TABLE, FOLDER_SONGS_TABLE, GENRES_BY_NAME_TABLE,
    GENRES_TABLE, SCAN_FAILURES_TABLE, SONGS_BY_PATH_TABLE, SONGS_TABLE,
};
use crate::LibraryError;

/// Post-scan work for one folder, applied in a single transaction.
#[derive(Clone, Debug, Default)]
pub struct CleanupPlan {
    pub folder_id: String,
    /// Songs confirmed missing by a full walk.
    pub removed_song_ids: Vec<String>,
    pub failures: Vec<ScanFailure>,
    /// Replace the folder's failure ledger instead of amending it.
    pub replace_failures: bool,
    /// Paths walked by a targeted scan; their old ledger entries are dropped.
    pub rescanned_paths: Vec<String>,
    pub mark_scanned: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub songs_removed: usize,
    pub artists_removed: usize,
    pub albums_removed: usize,
    pub genres_removed: usize,
}

impl Catalog {
    pub fn run_cleanup(&self, plan: &CleanupPlan) -> Result<CleanupReport, LibraryError> {
        let db = self.db();
        let write_txn = db.begin_write()?;
        let mut report = CleanupReport::default();

        report.songs_removed = remove_songs(&write_txn, &plan.removed_song_ids)?;

        {
            let mut ledger = write_txn.open_table(SCAN_FAILURES_TABLE)?;
            if plan.replace_failures {
                let stale = keys_with_prefix(&ledger, &prefix_key(&plan.folder_id))?;
                for key in stale {
                    ledger.remove(key.as_str())?;
                }
            } else {
                for path in &plan.rescanned_paths {
                    ledger.remove(failure_key(&plan.folder_id, path).as_str())?;
                }
            }
            for failure in &plan.failures {
                let key = failure_key(&failure.folder_id, &failure.path);
                let bytes = encode_value(failure)?;
                ledger.insert(key.as_str(), bytes.as_slice())?;
            }
        }

        purge_orphans(&write_txn, &mut report)?;

        if plan.mark_scanned {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let folder: Option<Folder> = match folders.get(plan.folder_id.as_str())? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            if let Some(mut folder) = folder {
                folder.last_scanned_at = Some(now_secs());
                let bytes = encode_value(&folder)?;
                folders.insert(plan.folder_id.as_str(), bytes.as_slice())?;
            }
        }

        write_txn.commit()?;
        if report != CleanupReport::default() {
            info!(
                "Cleanup removed {} songs, {} artists, {} albums, {} genres",
                report.songs_removed,
                report.artists_removed,
                report.albums_removed,
                report.genres_removed
            );
        }
        Ok(report)
    }

    /// Unregisters a folder. Refuses while it still owns songs unless
    /// `cascade` is set, in which case its songs go with it.
    pub fn remove_folder(&self, root: &Path, cascade: bool) -> Result<CleanupReport, LibraryError> {
        let folder = self
            .get_folder_by_path(root)?
            .ok_or_else(|| LibraryError::FolderNotFound(root.display().to_string()))?;

        let db = self.db();
        let write_txn = db.begin_write()?;
        let mut report = CleanupReport::default();

        let song_ids = {
            let folder_songs = write_txn.open_table(FOLDER_SONGS_TABLE)?;
            let keys = keys_with_prefix(&folder_songs, &prefix_key(&folder.id))?;
            let mut ids = Vec::with_capacity(keys.len());
            for key in keys {
                let (_, song_id) = crate::store::split_key_last(&key)?;
                ids.push(song_id.to_string());
            }
            ids
        };
        if !song_ids.is_empty() && !cascade {
            return Err(LibraryError::FolderNotEmpty(folder.path, song_ids.len()));
        }

        report.songs_removed = remove_songs(&write_txn, &song_ids)?;
        {
            let mut ledger = write_txn.open_table(SCAN_FAILURES_TABLE)?;
            for key in keys_with_prefix(&ledger, &prefix_key(&folder.id))? {
                ledger.remove(key.as_str())?;
            }
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            folders.remove(folder.id.as_str())?;
            let mut by_path = write_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
            by_path.remove(path_key(root).as_str())?;
        }
        purge_orphans(&write_txn, &mut report)?;

        write_txn.commit()?;
        info!(
            "Removed folder {} ({} songs)",
            folder.path, report.songs_removed
        );
        Ok(report)
    }
}

fn remove_songs(txn: &WriteTransaction, song_ids: &[String]) -> Result<usize, LibraryError> {
    let mut songs = txn.open_table(SONGS_TABLE)?;
    let mut songs_by_path = txn.open_table(SONGS_BY_PATH_TABLE)?;
    let mut folder_songs = txn.open_table(FOLDER_SONGS_TABLE)?;

    let mut removed = 0usize;
    for song_id in song_ids {
        let song: Song = match songs.get(song_id.as_str())? {
            Some(value) => decode_value(value.value())?,
            None => continue,
        };
        songs.remove(song_id.as_str())?;
        songs_by_path.remove(path_key(Path::new(&song.path)).as_str())?;
        folder_songs.remove(folder_song_key(&song.folder_id, &song.id).as_str())?;
        debug!("Removed song {}", song.path);
        removed += 1;
    }
    Ok(removed)
}

/// Deletes albums, artists and genres no song refers to any more. An
/// artist is kept while a surviving album names it.
fn purge_orphans(txn: &WriteTransaction, report: &mut CleanupReport) -> Result<(), LibraryError> {
    let mut artist_refs: HashSet<String> = HashSet::new();
    let mut album_refs: HashSet<String> = HashSet::new();
    let mut genre_refs: HashSet<String> = HashSet::new();

    {
        let songs = txn.open_table(SONGS_TABLE)?;
        for entry in songs.iter()? {
            let entry = entry?;
            let song: Song = decode_value(entry.1.value())?;
            album_refs.insert(song.album_id.clone());
            artist_refs.extend(song.artist_ids().map(str::to_string));
            genre_refs.extend(song.genre_ids.iter().cloned());
        }
    }

    {
        let mut albums = txn.open_table(ALBUMS_TABLE)?;
        let mut albums_by_key = txn.open_table(ALBUMS_BY_KEY_TABLE)?;
        let mut orphaned = Vec::new();
        for entry in albums.iter()? {
            let entry = entry?;
            let album: Album = decode_value(entry.1.value())?;
            if album_refs.contains(&album.id) {
                artist_refs.insert(album.artist_id);
            } else {
                orphaned.push(album);
            }
        }
        for album in orphaned {
            albums.remove(album.id.as_str())?;
            albums_by_key.remove(album_key(&album.title, &album.artist_id).as_str())?;
            report.albums_removed += 1;
        }
    }

    report.artists_removed = purge_named::<Artist>(
        txn,
        ARTISTS_TABLE,
        ARTISTS_BY_NAME_TABLE,
        &artist_refs,
        |artist| (artist.id.clone(), normalize_name(&artist.name)),
    )?;
    report.genres_removed = purge_named::<Genre>(
        txn,
        GENRES_TABLE,
        GENRES_BY_NAME_TABLE,
        &genre_refs,
        |genre| (genre.id.clone(), normalize_name(&genre.name)),
    )?;
    Ok(())
}

fn purge_named<T>(
    txn: &WriteTransaction,
    rows: RowTable,
    by_name: RowTable,
    referenced: &HashSet<String>,
    keys: impl Fn(&T) -> (String, String),
) -> Result<usize, LibraryError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let mut rows = txn.open_table(rows)?;
    let mut by_name = txn.open_table(by_name)?;

    let mut orphaned = Vec::new();
    for entry in rows.iter()? {
        let entry = entry?;
        let row: T = decode_value(entry.1.value())?;
        let (id, name_key) = keys(&row);
        if !referenced.contains(&id) {
            orphaned.push((id, name_key));
        }
    }
    for (id, name_key) in &orphaned {
        rows.remove(id.as_str())?;
        by_name.remove(name_key.as_str())?;
    }
    Ok(orphaned.len())
}

fn keys_with_prefix<T>(table: &T, prefix: &str) -> Result<Vec<String>, LibraryError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    let mut keys = Vec::new();
    for entry in table.range(prefix..end.as_str())? {
        let entry = entry?;
        keys.push(entry.0.value().to_string());
    }
    Ok(keys)
}
