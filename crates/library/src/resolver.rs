use std::collections::HashMap;

use common::{
    album_id, artist_id, genre_id, normalize_name, Album, Artist, Genre, UNKNOWN_ALBUM,
    UNKNOWN_ARTIST,
};
use metadata::TagInfo;

use crate::batch::EntityRow;
use crate::store::{album_key, EntityIndex};

/// Entity references for one song, plus the rows they point at.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedEntities {
    pub artist_id: String,
    pub featured_artist_ids: Vec<String>,
    pub album_id: String,
    pub genre_ids: Vec<String>,
    pub rows: Vec<EntityRow>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolverCounts {
    pub artists_created: usize,
    pub albums_created: usize,
    pub genres_created: usize,
}

#[derive(Clone, Debug)]
struct Known {
    id: String,
    display: String,
}

/// Maps tag strings to entity ids for the duration of one scan.
///
/// Seeded once from the catalog. Names are compared in normalised form;
/// the first display spelling seen for a name is the one kept.
pub struct EntityResolver {
    separators: Vec<String>,
    artists: HashMap<String, Known>,
    albums: HashMap<String, Known>,
    genres: HashMap<String, Known>,
    counts: ResolverCounts,
}

impl EntityResolver {
    pub fn new(index: EntityIndex, separators: &[String]) -> Self {
        let separators = separators
            .iter()
            .filter(|sep| !sep.is_empty())
            .map(|sep| sep.to_ascii_lowercase())
            .collect();

        let artists = index
            .artists
            .into_iter()
            .map(|(key, (id, display))| (key, Known { id, display }))
            .collect();
        let albums = index
            .albums
            .into_iter()
            .map(|(key, (id, display))| (key, Known { id, display }))
            .collect();
        let genres = index
            .genres
            .into_iter()
            .map(|(key, (id, display))| (key, Known { id, display }))
            .collect();

        Self {
            separators,
            artists,
            albums,
            genres,
            counts: ResolverCounts::default(),
        }
    }

    pub fn counts(&self) -> ResolverCounts {
        self.counts
    }

    /// Splits a multi-artist credit on the configured separators, matched
    /// case-insensitively. Empty and repeated credits are dropped.
    pub fn split_artists(&self, raw: &str) -> Vec<String> {
        let lowered = raw.to_ascii_lowercase();
        let mut parts: Vec<&str> = Vec::new();
        let mut start = 0;
        let mut pos = 0;

        while pos < raw.len() {
            let matched = self
                .separators
                .iter()
                .find(|sep| lowered[pos..].starts_with(sep.as_str()));
            match matched {
                Some(sep) => {
                    parts.push(&raw[start..pos]);
                    pos += sep.len();
                    start = pos;
                }
                None => {
                    pos += raw[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
                }
            }
        }
        parts.push(&raw[start..]);

        let mut out: Vec<String> = Vec::new();
        for part in parts {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            let key = normalize_name(trimmed);
            if out.iter().any(|existing| normalize_name(existing) == key) {
                continue;
            }
            out.push(trimmed.to_string());
        }
        out
    }

    /// Resolves the artist, album and genre references of one file.
    /// `fallback_album` is used when the file carries no album tag.
    pub fn resolve(&mut self, tags: &TagInfo, fallback_album: Option<&str>) -> ResolvedEntities {
        let mut rows = Vec::new();

        let credit = tags
            .artist
            .as_deref()
            .or(tags.album_artist.as_deref())
            .unwrap_or(UNKNOWN_ARTIST);
        let mut credits = self.split_artists(credit);
        if credits.is_empty() {
            credits.push(UNKNOWN_ARTIST.to_string());
        }

        let mut artist_ids: Vec<String> = Vec::with_capacity(credits.len());
        for name in &credits {
            let (id, row) = self.artist(name);
            rows.push(row);
            if !artist_ids.contains(&id) {
                artist_ids.push(id);
            }
        }
        let primary = artist_ids.remove(0);

        let album_artist = match tags.album_artist.as_deref() {
            Some(name) => {
                let (id, row) = self.artist(name);
                rows.push(row);
                id
            }
            None => primary.clone(),
        };

        let title = tags
            .album
            .as_deref()
            .or(fallback_album)
            .unwrap_or(UNKNOWN_ALBUM);
        let (album, row) = self.album(title, &album_artist);
        rows.push(row);

        let mut genre_ids = Vec::new();
        for name in &tags.genres {
            if normalize_name(name).is_empty() {
                continue;
            }
            let (id, row) = self.genre(name);
            if !genre_ids.contains(&id) {
                genre_ids.push(id);
                rows.push(row);
            }
        }

        ResolvedEntities {
            artist_id: primary,
            featured_artist_ids: artist_ids,
            album_id: album,
            genre_ids,
            rows,
        }
    }

    fn artist(&mut self, name: &str) -> (String, EntityRow) {
        let key = normalize_name(name);
        let known = match self.artists.get(&key) {
            Some(known) => known.clone(),
            None => {
                let known = Known {
                    id: artist_id(name),
                    display: name.trim().to_string(),
                };
                self.artists.insert(key, known.clone());
                self.counts.artists_created += 1;
                known
            }
        };
        let row = EntityRow::Artist(Artist {
            id: known.id.clone(),
            name: known.display,
            biography: None,
            image_path: None,
            metadata_checked_at: None,
        });
        (known.id, row)
    }

    fn album(&mut self, title: &str, artist: &str) -> (String, EntityRow) {
        let key = album_key(title, artist);
        let known = match self.albums.get(&key) {
            Some(known) => known.clone(),
            None => {
                let known = Known {
                    id: album_id(title, artist),
                    display: title.trim().to_string(),
                };
                self.albums.insert(key, known.clone());
                self.counts.albums_created += 1;
                known
            }
        };
        let row = EntityRow::Album(Album {
            id: known.id.clone(),
            artist_id: artist.to_string(),
            title: known.display,
            art_path: None,
            art_url: None,
            art_checked_at: None,
        });
        (known.id, row)
    }

    fn genre(&mut self, name: &str) -> (String, EntityRow) {
        let key = normalize_name(name);
        let known = match self.genres.get(&key) {
            Some(known) => known.clone(),
            None => {
                let known = Known {
                    id: genre_id(name),
                    display: name.trim().to_string(),
                };
                self.genres.insert(key, known.clone());
                self.counts.genres_created += 1;
                known
            }
        };
        let row = EntityRow::Genre(Genre {
            id: known.id.clone(),
            name: known.display,
        });
        (known.id, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(separators: &[&str]) -> EntityResolver {
        let separators: Vec<String> = separators.iter().map(|s| s.to_string()).collect();
        EntityResolver::new(EntityIndex::default(), &separators)
    }

    fn tags(artist: Option<&str>, album_artist: Option<&str>, album: Option<&str>) -> TagInfo {
        TagInfo {
            artist: artist.map(str::to_string),
            album_artist: album_artist.map(str::to_string),
            album: album.map(str::to_string),
            ..TagInfo::default()
        }
    }

    #[test]
    fn splits_on_configured_separators_only() {
        let resolver = resolver(&[";", " feat. "]);
        assert_eq!(
            resolver.split_artists("Alice FEAT. Bob; Carol"),
            vec!["Alice", "Bob", "Carol"]
        );
        assert_eq!(resolver.split_artists("AC/DC"), vec!["AC/DC"]);
        assert_eq!(resolver.split_artists(" ; Alice;alice "), vec!["Alice"]);
    }

    #[test]
    fn casing_variants_share_one_artist() {
        let mut resolver = resolver(&[";"]);
        let first = resolver.resolve(&tags(Some("The Beatles"), None, Some("Help!")), None);
        let second = resolver.resolve(&tags(Some("  the  beatles"), None, Some("help!")), None);

        assert_eq!(first.artist_id, second.artist_id);
        assert_eq!(first.album_id, second.album_id);
        assert_eq!(resolver.counts().artists_created, 1);
        assert_eq!(resolver.counts().albums_created, 1);
        match &second.rows[0] {
            EntityRow::Artist(artist) => assert_eq!(artist.name, "The Beatles"),
            other => panic!("unexpected row {:?}", other),
        }
    }

    #[test]
    fn album_artist_owns_the_album() {
        let mut resolver = resolver(&[" & "]);
        let resolved = resolver.resolve(
            &tags(Some("Alice & Bob"), Some("Various Artists"), Some("Hits")),
            None,
        );

        assert_eq!(resolved.artist_id, artist_id("Alice"));
        assert_eq!(resolved.featured_artist_ids, vec![artist_id("Bob")]);
        assert_eq!(
            resolved.album_id,
            album_id("Hits", &artist_id("Various Artists"))
        );
    }

    #[test]
    fn missing_tags_fall_back() {
        let mut resolver = resolver(&[";"]);
        let resolved = resolver.resolve(&TagInfo::default(), Some("Folder Name"));
        assert_eq!(resolved.artist_id, artist_id(UNKNOWN_ARTIST));
        assert_eq!(
            resolved.album_id,
            album_id("Folder Name", &artist_id(UNKNOWN_ARTIST))
        );

        let resolved = resolver.resolve(&TagInfo::default(), None);
        assert_eq!(
            resolved.album_id,
            album_id(UNKNOWN_ALBUM, &artist_id(UNKNOWN_ARTIST))
        );
    }

    #[test]
    fn seeded_names_are_reused() {
        let mut index = EntityIndex::default();
        index.artists.insert(
            normalize_name("Björk"),
            ("stored-id".to_string(), "Björk".to_string()),
        );
        index.genres.insert(
            normalize_name("Electronic"),
            ("genre-id".to_string(), "Electronic".to_string()),
        );
        let mut resolver = EntityResolver::new(index, &[";".to_string()]);
        let mut info = tags(Some("björk"), None, Some("Post"));
        info.genres = vec!["electronic".to_string(), "ELECTRONIC".to_string()];
        let resolved = resolver.resolve(&info, None);

        assert_eq!(resolved.artist_id, "stored-id");
        assert_eq!(resolved.genre_ids, vec!["genre-id".to_string()]);
        assert_eq!(resolver.counts().artists_created, 0);
        assert_eq!(resolver.counts().genres_created, 0);
    }
}
