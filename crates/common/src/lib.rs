use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub path: String,
    pub added_at: u64,
    pub last_scanned_at: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub biography: Option<String>,
    pub image_path: Option<String>,
    pub metadata_checked_at: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub artist_id: String,
    pub title: String,
    pub art_path: Option<String>,
    pub art_url: Option<String>,
    pub art_checked_at: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Genre {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    pub path: String,
    pub folder_id: String,
    pub title: String,
    pub artist_id: String,
    pub featured_artist_ids: Vec<String>,
    pub album_id: String,
    pub genre_ids: Vec<String>,
    pub duration_ms: u32,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub year: Option<i32>,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub modified_ms: i64,
    pub file_size: u64,
    pub added_at: u64,
    pub play_count: u32,
    pub last_played: Option<u64>,
    pub cover_art_path: Option<String>,
    pub lyrics_path: Option<String>,
    pub lyrics_checked_at: Option<u64>,
}

impl Song {
    /// Every artist this song credits, primary first.
    pub fn artist_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.artist_id.as_str())
            .chain(self.featured_artist_ids.iter().map(String::as_str))
    }
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn artist_id(name: &str) -> String {
    stable_id(&format!("artist\x1f{}", normalize_name(name)))
}

pub fn album_id(title: &str, artist_id: &str) -> String {
    stable_id(&format!("album\x1f{}\x1f{}", normalize_name(title), artist_id))
}

pub fn genre_id(name: &str) -> String {
    stable_id(&format!("genre\x1f{}", normalize_name(name)))
}

pub fn song_id(path: &Path) -> String {
    stable_id(&format!("song\x1f{}", path_key(path)))
}

pub fn folder_id(path: &Path) -> String {
    stable_id(&format!("folder\x1f{}", path_key(path)))
}

/// Trimmed, whitespace-collapsed, case-folded form used for entity identity.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for word in name.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&word.to_lowercase());
    }
    out
}

/// Comparison key for file paths. Case-insensitive only where the host
/// filesystem is.
pub fn path_key(path: &Path) -> String {
    let text = path_to_slash_string(path);
    if cfg!(any(windows, target_os = "macos")) {
        text.to_lowercase()
    } else {
        text
    }
}

pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// True when `path` is `root` or lies beneath it.
pub fn path_within(path: &Path, root: &Path) -> bool {
    let path = path_key(path);
    let root = path_key(root);
    if path == root {
        return true;
    }
    let root = root.trim_end_matches('/');
    path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/'
}

fn path_to_slash_string(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push('/'),
            other => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&other.as_os_str().to_string_lossy());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("Artist/Album/Track.mp3");
        let second = stable_id("Artist/Album/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("Artist/Album/Track2.mp3"));
    }

    #[test]
    fn normalize_name_folds_case_and_whitespace() {
        assert_eq!(normalize_name("  The   Beatles "), "the beatles");
        assert_eq!(normalize_name("THE BEATLES"), normalize_name("the beatles"));
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn entity_ids_ignore_naming_variants() {
        assert_eq!(artist_id("The Beatles"), artist_id(" the  beatles"));
        assert_ne!(artist_id("The Beatles"), genre_id("The Beatles"));
        let artist = artist_id("Radiohead");
        assert_eq!(album_id("OK Computer", &artist), album_id("ok computer ", &artist));
        assert_ne!(album_id("OK Computer", &artist), album_id("OK Computer", "other"));
    }

    #[test]
    fn path_within_respects_component_boundaries() {
        let root = Path::new("/music/rock");
        assert!(path_within(Path::new("/music/rock"), root));
        assert!(path_within(Path::new("/music/rock/a.mp3"), root));
        assert!(!path_within(Path::new("/music/rocksteady/a.mp3"), root));
        assert!(!path_within(Path::new("/music"), root));
    }

    #[test]
    fn path_key_is_slash_separated() {
        assert_eq!(path_key(Path::new("/music/a/b.mp3")), "/music/a/b.mp3");
    }
}
