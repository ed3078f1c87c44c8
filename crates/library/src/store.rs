use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{folder_id, normalize_name, path_key, path_string, Album, Artist, Folder, Genre, Song};
use redb::{Database, ReadableTable, TableDefinition, TableError, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batch::{EntityRow, SongUpsert};
use crate::LibraryError;

const INDEX_VERSION: u32 = 1;
pub(crate) const KEY_SEP: char = '\x1f';

pub(crate) type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;

pub(crate) const META_TABLE: RowTable = TableDefinition::new("meta");
pub(crate) const FOLDERS_TABLE: RowTable = TableDefinition::new("folders");
pub(crate) const FOLDERS_BY_PATH_TABLE: RowTable = TableDefinition::new("folders_by_path");
pub(crate) const SONGS_TABLE: RowTable = TableDefinition::new("songs");
pub(crate) const SONGS_BY_PATH_TABLE: RowTable = TableDefinition::new("songs_by_path");
pub(crate) const FOLDER_SONGS_TABLE: RowTable = TableDefinition::new("folder_songs");
pub(crate) const ARTISTS_TABLE: RowTable = TableDefinition::new("artists");
pub(crate) const ARTISTS_BY_NAME_TABLE: RowTable = TableDefinition::new("artists_by_name");
pub(crate) const ALBUMS_TABLE: RowTable = TableDefinition::new("albums");
pub(crate) const ALBUMS_BY_KEY_TABLE: RowTable = TableDefinition::new("albums_by_key");
pub(crate) const GENRES_TABLE: RowTable = TableDefinition::new("genres");
pub(crate) const GENRES_BY_NAME_TABLE: RowTable = TableDefinition::new("genres_by_name");
pub(crate) const SCAN_FAILURES_TABLE: RowTable = TableDefinition::new("scan_failures");

const ALL_TABLES: &[RowTable] = &[
    META_TABLE,
    FOLDERS_TABLE,
    FOLDERS_BY_PATH_TABLE,
    SONGS_TABLE,
    SONGS_BY_PATH_TABLE,
    FOLDER_SONGS_TABLE,
    ARTISTS_TABLE,
    ARTISTS_BY_NAME_TABLE,
    ALBUMS_TABLE,
    ALBUMS_BY_KEY_TABLE,
    GENRES_TABLE,
    GENRES_BY_NAME_TABLE,
    SCAN_FAILURES_TABLE,
];

const META_VERSION_KEY: &str = "version";

/// Stored state of one song, as needed by change detection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SongStamp {
    pub song_id: String,
    pub path: String,
    pub modified_ms: i64,
    pub file_size: u64,
}

/// Normalised-name lookups for every entity currently in the catalog.
#[derive(Clone, Debug, Default)]
pub struct EntityIndex {
    pub artists: HashMap<String, (String, String)>,
    pub albums: HashMap<String, (String, String)>,
    pub genres: HashMap<String, (String, String)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub folders: usize,
    pub songs: usize,
    pub artists: usize,
    pub albums: usize,
    pub genres: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanFailure {
    pub folder_id: String,
    pub path: String,
    pub reason: String,
    pub last_seen: u64,
}

/// Fields written back by enrichment. `None` leaves the stored value alone.
#[derive(Clone, Debug, Default)]
pub struct ArtistEnrichment {
    pub biography: Option<String>,
    pub image_path: Option<String>,
}

#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };
        Self::with_db(Arc::new(db))
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self, LibraryError> {
        let catalog = Self { db };
        catalog.init_tables()?;
        Ok(catalog)
    }

    pub fn db(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    fn init_tables(&self) -> Result<(), LibraryError> {
        let version = read_version(&self.db)?;
        let write_txn = self.db.begin_write()?;
        match version {
            Some(version) if version == INDEX_VERSION => {}
            Some(version) => {
                warn!("Catalog version mismatch ({}); resetting", version);
                for table in ALL_TABLES {
                    clear_table(&write_txn, *table)?;
                }
            }
            None => info!("Creating catalog tables"),
        }
        for table in ALL_TABLES {
            write_txn.open_table(*table)?;
        }
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let bytes = encode_value(&INDEX_VERSION)?;
            meta.insert(META_VERSION_KEY, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn ensure_folder(&self, root: &Path) -> Result<Folder, LibraryError> {
        let key = path_key(root);
        let write_txn = self.db.begin_write()?;
        let folder = {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let mut by_path = write_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
            let id = folder_id(root);
            let existing: Option<Folder> = match folders.get(id.as_str())? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            match existing {
                Some(folder) => folder,
                None => {
                    let folder = Folder {
                        id: id.clone(),
                        path: path_string(root),
                        added_at: now_secs(),
                        last_scanned_at: None,
                    };
                    let bytes = encode_value(&folder)?;
                    folders.insert(id.as_str(), bytes.as_slice())?;
                    by_path.insert(key.as_str(), id.as_bytes())?;
                    info!("Registered folder {}", folder.path);
                    folder
                }
            }
        };
        write_txn.commit()?;
        Ok(folder)
    }

    pub fn get_folder_by_path(&self, root: &Path) -> Result<Option<Folder>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
        let folders = read_txn.open_table(FOLDERS_TABLE)?;
        let id = match by_path.get(path_key(root).as_str())? {
            Some(value) => bytes_to_string(value.value())?,
            None => return Ok(None),
        };
        let folder = match folders.get(id.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(folder)
    }

    pub fn list_folders(&self) -> Result<Vec<Folder>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let folders = read_txn.open_table(FOLDERS_TABLE)?;
        let mut out = Vec::new();
        for entry in folders.iter()? {
            let entry = entry?;
            let folder: Folder = decode_value(entry.1.value())?;
            out.push(folder);
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Every song owned by a folder, keyed by path comparison key.
    pub fn folder_snapshot(
        &self,
        folder_id: &str,
    ) -> Result<HashMap<String, SongStamp>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let folder_songs = read_txn.open_table(FOLDER_SONGS_TABLE)?;
        let songs = read_txn.open_table(SONGS_TABLE)?;

        let prefix = prefix_key(folder_id);
        let mut end = prefix.clone();
        end.push('\u{10ffff}');
        let mut out = HashMap::new();

        for entry in folder_songs.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let (_, song_id) = split_key_last(entry.0.value())?;
            if let Some(value) = songs.get(song_id)? {
                let song: Song = decode_value(value.value())?;
                out.insert(
                    path_key(Path::new(&song.path)),
                    SongStamp {
                        song_id: song.id,
                        path: song.path,
                        modified_ms: song.modified_ms,
                        file_size: song.file_size,
                    },
                );
            }
        }

        Ok(out)
    }

    pub fn entity_index(&self) -> Result<EntityIndex, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let mut index = EntityIndex::default();

        let artists = read_txn.open_table(ARTISTS_TABLE)?;
        for entry in artists.iter()? {
            let entry = entry?;
            let artist: Artist = decode_value(entry.1.value())?;
            index
                .artists
                .insert(normalize_name(&artist.name), (artist.id, artist.name));
        }

        let albums = read_txn.open_table(ALBUMS_TABLE)?;
        for entry in albums.iter()? {
            let entry = entry?;
            let album: Album = decode_value(entry.1.value())?;
            index.albums.insert(
                album_key(&album.title, &album.artist_id),
                (album.id, album.title),
            );
        }

        let genres = read_txn.open_table(GENRES_TABLE)?;
        for entry in genres.iter()? {
            let entry = entry?;
            let genre: Genre = decode_value(entry.1.value())?;
            index
                .genres
                .insert(normalize_name(&genre.name), (genre.id, genre.name));
        }

        Ok(index)
    }

    /// Writes one batch of upserts in a single transaction.
    pub fn write_batch(&self, batch: &[SongUpsert]) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut songs_by_path = write_txn.open_table(SONGS_BY_PATH_TABLE)?;
            let mut folder_songs = write_txn.open_table(FOLDER_SONGS_TABLE)?;
            let mut artists = write_txn.open_table(ARTISTS_TABLE)?;
            let mut artists_by_name = write_txn.open_table(ARTISTS_BY_NAME_TABLE)?;
            let mut albums = write_txn.open_table(ALBUMS_TABLE)?;
            let mut albums_by_key = write_txn.open_table(ALBUMS_BY_KEY_TABLE)?;
            let mut genres = write_txn.open_table(GENRES_TABLE)?;
            let mut genres_by_name = write_txn.open_table(GENRES_BY_NAME_TABLE)?;

            for upsert in batch {
                for entity in &upsert.entities {
                    match entity {
                        EntityRow::Artist(artist) => {
                            let key = normalize_name(&artist.name);
                            if artists_by_name.get(key.as_str())?.is_none() {
                                let bytes = encode_value(artist)?;
                                artists.insert(artist.id.as_str(), bytes.as_slice())?;
                                artists_by_name.insert(key.as_str(), artist.id.as_bytes())?;
                            }
                        }
                        EntityRow::Album(album) => {
                            let key = album_key(&album.title, &album.artist_id);
                            if albums_by_key.get(key.as_str())?.is_none() {
                                let bytes = encode_value(album)?;
                                albums.insert(album.id.as_str(), bytes.as_slice())?;
                                albums_by_key.insert(key.as_str(), album.id.as_bytes())?;
                            }
                        }
                        EntityRow::Genre(genre) => {
                            let key = normalize_name(&genre.name);
                            if genres_by_name.get(key.as_str())?.is_none() {
                                let bytes = encode_value(genre)?;
                                genres.insert(genre.id.as_str(), bytes.as_slice())?;
                                genres_by_name.insert(key.as_str(), genre.id.as_bytes())?;
                            }
                        }
                    }
                }

                let mut song = upsert.song.clone();
                let previous: Option<Song> = match songs.get(song.id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                if let Some(previous) = previous {
                    song.added_at = previous.added_at;
                    song.play_count = previous.play_count;
                    song.last_played = previous.last_played;
                    song.lyrics_path = previous.lyrics_path;
                    song.lyrics_checked_at = previous.lyrics_checked_at;
                    if previous.folder_id != song.folder_id {
                        let old_key = folder_song_key(&previous.folder_id, &song.id);
                        folder_songs.remove(old_key.as_str())?;
                    }
                }

                if let Some(cover) = &song.cover_art_path {
                    let album: Option<Album> = match albums.get(song.album_id.as_str())? {
                        Some(value) => Some(decode_value(value.value())?),
                        None => None,
                    };
                    if let Some(mut album) = album {
                        if album.art_path.is_none() {
                            album.art_path = Some(cover.clone());
                            let bytes = encode_value(&album)?;
                            albums.insert(album.id.as_str(), bytes.as_slice())?;
                        }
                    }
                }

                let bytes = encode_value(&song)?;
                songs.insert(song.id.as_str(), bytes.as_slice())?;
                let by_path_key = path_key(Path::new(&song.path));
                songs_by_path.insert(by_path_key.as_str(), song.id.as_bytes())?;
                let index_key = folder_song_key(&song.folder_id, &song.id);
                folder_songs.insert(index_key.as_str(), song.id.as_bytes())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CatalogStats, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let stats = CatalogStats {
            folders: read_txn.open_table(FOLDERS_TABLE)?.len()? as usize,
            songs: read_txn.open_table(SONGS_TABLE)?.len()? as usize,
            artists: read_txn.open_table(ARTISTS_TABLE)?.len()? as usize,
            albums: read_txn.open_table(ALBUMS_TABLE)?.len()? as usize,
            genres: read_txn.open_table(GENRES_TABLE)?.len()? as usize,
        };
        Ok(stats)
    }

    pub fn get_song(&self, song_id: &str) -> Result<Option<Song>, LibraryError> {
        self.get_row(SONGS_TABLE, song_id)
    }

    pub fn get_song_by_path(&self, path: &Path) -> Result<Option<Song>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(SONGS_BY_PATH_TABLE)?;
        let songs = read_txn.open_table(SONGS_TABLE)?;
        let id = match by_path.get(path_key(path).as_str())? {
            Some(value) => bytes_to_string(value.value())?,
            None => return Ok(None),
        };
        let song = match songs.get(id.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(song)
    }

    pub fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>, LibraryError> {
        self.get_row(ARTISTS_TABLE, artist_id)
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, LibraryError> {
        self.get_row(ALBUMS_TABLE, album_id)
    }

    pub fn get_genre(&self, genre_id: &str) -> Result<Option<Genre>, LibraryError> {
        self.get_row(GENRES_TABLE, genre_id)
    }

    fn get_row<T: for<'de> Deserialize<'de>>(
        &self,
        table: RowTable,
        id: &str,
    ) -> Result<Option<T>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let row = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(row)
    }

    pub fn list_artists(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Artist>, usize), LibraryError> {
        self.list_by_index(ARTISTS_BY_NAME_TABLE, ARTISTS_TABLE, search, limit, offset)
    }

    pub fn list_albums(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Album>, usize), LibraryError> {
        self.list_by_index(ALBUMS_BY_KEY_TABLE, ALBUMS_TABLE, search, limit, offset)
    }

    pub fn list_genres(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Genre>, usize), LibraryError> {
        self.list_by_index(GENRES_BY_NAME_TABLE, GENRES_TABLE, search, limit, offset)
    }

    pub fn list_songs(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Song>, usize), LibraryError> {
        self.list_by_index(SONGS_BY_PATH_TABLE, SONGS_TABLE, search, limit, offset)
    }

    fn list_by_index<T: for<'de> Deserialize<'de>>(
        &self,
        index: RowTable,
        rows: RowTable,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<T>, usize), LibraryError> {
        let search = search
            .map(normalize_name)
            .filter(|value| !value.is_empty());

        let read_txn = self.db.begin_read()?;
        let index_table = read_txn.open_table(index)?;
        let row_table = read_txn.open_table(rows)?;

        let mut total = 0usize;
        let mut items = Vec::new();

        for entry in index_table.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            if let Some(search) = &search {
                if !key.to_lowercase().contains(search.as_str()) {
                    continue;
                }
            }

            total += 1;
            if total <= offset {
                continue;
            }
            if items.len() >= limit {
                continue;
            }

            let id = bytes_to_string(entry.1.value())?;
            if let Some(value) = row_table.get(id.as_str())? {
                items.push(decode_value(value.value())?);
            }
        }

        Ok((items, total))
    }

    pub fn record_play(&self, song_id: &str) -> Result<bool, LibraryError> {
        self.update_row(SONGS_TABLE, song_id, |song: &mut Song| {
            song.play_count = song.play_count.saturating_add(1);
            song.last_played = Some(now_secs());
            true
        })
    }

    pub fn update_artist_enrichment(
        &self,
        artist_id: &str,
        update: ArtistEnrichment,
        checked_at: Option<u64>,
    ) -> Result<bool, LibraryError> {
        self.update_row(ARTISTS_TABLE, artist_id, |artist: &mut Artist| {
            if let Some(biography) = update.biography.and_then(clean_text) {
                artist.biography = Some(biography);
            }
            if let Some(image_path) = update.image_path {
                artist.image_path = Some(image_path);
            }
            if checked_at.is_some() {
                artist.metadata_checked_at = checked_at;
            }
            true
        })
    }

    pub fn update_album_art(
        &self,
        album_id: &str,
        art_path: Option<String>,
        art_url: Option<String>,
        checked_at: Option<u64>,
    ) -> Result<bool, LibraryError> {
        self.update_row(ALBUMS_TABLE, album_id, |album: &mut Album| {
            if art_path.is_some() {
                album.art_path = art_path;
            }
            if art_url.is_some() {
                album.art_url = art_url;
            }
            if checked_at.is_some() {
                album.art_checked_at = checked_at;
            }
            true
        })
    }

    pub fn update_song_lyrics(
        &self,
        song_id: &str,
        lyrics_path: Option<String>,
        checked_at: Option<u64>,
    ) -> Result<bool, LibraryError> {
        self.update_row(SONGS_TABLE, song_id, |song: &mut Song| {
            if lyrics_path.is_some() {
                song.lyrics_path = lyrics_path;
            }
            if checked_at.is_some() {
                song.lyrics_checked_at = checked_at;
            }
            true
        })
    }

    fn update_row<T, F>(&self, table: RowTable, id: &str, apply: F) -> Result<bool, LibraryError>
    where
        T: Serialize + for<'de> Deserialize<'de>,
        F: FnOnce(&mut T) -> bool,
    {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut rows = write_txn.open_table(table)?;
            let mut row: T = match rows.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(false),
            };
            let updated = apply(&mut row);
            if updated {
                let bytes = encode_value(&row)?;
                rows.insert(id, bytes.as_slice())?;
            }
            updated
        };
        if updated {
            write_txn.commit()?;
        }
        Ok(updated)
    }

    pub fn list_scan_failures(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<ScanFailure>, usize), LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(SCAN_FAILURES_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok((Vec::new(), 0)),
            Err(err) => return Err(err.into()),
        };

        let mut total = 0usize;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            total += 1;
            if total <= offset {
                continue;
            }
            if items.len() >= limit {
                continue;
            }
            let info: ScanFailure = decode_value(entry.1.value())?;
            items.push(info);
        }

        Ok((items, total))
    }
}

fn read_version(db: &Database) -> Result<Option<u32>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let version = match table.get(META_VERSION_KEY)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(version)
}

fn clear_table(txn: &WriteTransaction, table: RowTable) -> Result<(), LibraryError> {
    match txn.delete_table(table) {
        Ok(_) => Ok(()),
        Err(TableError::TableDoesNotExist(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn bytes_to_string(bytes: &[u8]) -> Result<String, LibraryError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| LibraryError::KeyParse(String::from_utf8_lossy(bytes).to_string()))
}

pub(crate) fn album_key(title: &str, artist_id: &str) -> String {
    let mut out = normalize_name(title);
    out.push(KEY_SEP);
    out.push_str(artist_id);
    out
}

pub(crate) fn folder_song_key(folder_id: &str, song_id: &str) -> String {
    let mut out = prefix_key(folder_id);
    out.push_str(song_id);
    out
}

pub(crate) fn failure_key(folder_id: &str, path: &str) -> String {
    let mut out = prefix_key(folder_id);
    out.push_str(&path_key(Path::new(path)));
    out
}

pub(crate) fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

pub(crate) fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}

fn clean_text(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_split_on_last_separator() {
        let key = folder_song_key("folder", "song");
        assert_eq!(split_key_last(&key).unwrap(), ("folder", "song"));
        assert!(split_key_last("plain").is_err());
    }

    #[test]
    fn album_key_folds_title() {
        assert_eq!(album_key(" Abbey  Road", "a1"), album_key("abbey road", "a1"));
        assert_ne!(album_key("Abbey Road", "a1"), album_key("Abbey Road", "a2"));
    }

    #[test]
    fn reopening_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("catalog.redb");
        let root = dir.path().join("music");
        {
            let catalog = Catalog::open(&db_path).unwrap();
            catalog.ensure_folder(&root).unwrap();
        }
        let catalog = Catalog::open(&db_path).unwrap();
        let folder = catalog.get_folder_by_path(&root).unwrap().unwrap();
        assert_eq!(folder.id, folder_id(&root));
        assert_eq!(catalog.stats().unwrap().folders, 1);
    }

    #[test]
    fn ensure_folder_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        let root = dir.path().join("music");
        let first = catalog.ensure_folder(&root).unwrap();
        let second = catalog.ensure_folder(&root).unwrap();
        assert_eq!(first, second);
        assert_eq!(catalog.list_folders().unwrap().len(), 1);
    }
}
