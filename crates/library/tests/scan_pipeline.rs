use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{artist_id, song_id};
use library::{
    BatchFailurePolicy, BatchSink, Catalog, Library, LibraryError, ProgressReport, ScanOptions,
    ScanPhase, ScanRequest, ScanStatus, SongUpsert, TagReader,
};
use metadata::{CoverArt, MetadataError, TagInfo};
use tokio_util::sync::CancellationToken;

/// Reads `key=value` lines instead of real audio tags.
struct TextTags;

impl TagReader for TextTags {
    fn read(&self, path: &Path) -> Result<TagInfo, MetadataError> {
        let text = fs::read_to_string(path)?;
        if text.starts_with("corrupt") {
            return Err(MetadataError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unreadable header",
            )));
        }
        let mut info = TagInfo {
            duration_ms: Some(180_000),
            ..TagInfo::default()
        };
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.to_string();
            match key {
                "title" => info.title = Some(value),
                "artist" => info.artist = Some(value),
                "album_artist" => info.album_artist = Some(value),
                "album" => info.album = Some(value),
                "genre" => info.genres.push(value),
                "cover" => {
                    info.cover = Some(CoverArt {
                        data: value.into_bytes(),
                        mime: None,
                    })
                }
                _ => {}
            }
        }
        Ok(info)
    }
}

/// Commits through the catalog but rolls back the `fail_on`th batch.
struct FlakySink {
    catalog: Catalog,
    fail_on: usize,
    calls: AtomicUsize,
}

impl BatchSink for FlakySink {
    fn write_batch(&self, batch: &[SongUpsert]) -> Result<(), LibraryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(LibraryError::Io(io::Error::new(
                io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.catalog.write_batch(batch)
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    library: Library,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("music")).unwrap();
        let library = Library::open(&dir.path().join("catalog.redb")).unwrap();
        Self { dir, library }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("music")
    }

    fn write(&self, relpath: &str, tags: &str) -> PathBuf {
        let path = self.root().join(relpath);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, tags).unwrap();
        path
    }

    fn options(&self) -> ScanOptions {
        ScanOptions {
            batch_size: 2,
            workers: 2,
            artist_separators: Some(vec![";".to_string(), " feat. ".to_string()]),
            cover_cache_dir: Some(self.dir.path().join("cache")),
            ..ScanOptions::default()
        }
    }

    fn full(&self) -> ScanRequest {
        ScanRequest::full(self.root())
            .with_options(self.options())
            .with_tag_reader(Arc::new(TextTags))
    }

    fn targeted(&self, paths: Vec<PathBuf>) -> ScanRequest {
        ScanRequest::paths(self.root(), paths)
            .with_options(self.options())
            .with_tag_reader(Arc::new(TextTags))
    }
}

fn touch_later(path: &Path) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(120))
        .unwrap();
}

#[tokio::test]
async fn rescan_without_changes_is_idempotent() {
    let fx = Fixture::new();
    fx.write("A/one.mp3", "title=One\nartist=A\nalbum=X");
    fx.write("A/two.mp3", "title=Two\nartist=A\nalbum=X");
    fx.write("B/three.flac", "title=Three\nartist=B\nalbum=Y\ngenre=Rock");

    let first = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(first.status, ScanStatus::Complete);
    assert_eq!(first.counts.added, 3);
    let before = fx.library.stats().unwrap();

    let second = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(second.status, ScanStatus::Complete);
    assert!(second.added.is_empty());
    assert!(second.modified.is_empty());
    assert!(second.removed.is_empty());
    assert_eq!(second.counts.unchanged, 3);
    assert_eq!(fx.library.stats().unwrap(), before);
    assert_eq!(before.songs, 3);
    assert_eq!(before.artists, 2);
    assert_eq!(before.albums, 2);
    assert_eq!(before.genres, 1);
}

#[tokio::test]
async fn deleted_and_touched_files_are_classified() {
    let fx = Fixture::new();
    let a = fx.write("a.mp3", "title=A\nartist=Band");
    let b = fx.write("b.mp3", "title=B\nartist=Band");
    fx.library.scan(fx.full()).await.unwrap();

    fs::remove_file(&a).unwrap();
    touch_later(&b);
    let outcome = fx.library.scan(fx.full()).await.unwrap();

    assert_eq!(outcome.status, ScanStatus::Complete);
    assert_eq!(outcome.removed, vec![a.to_string_lossy().to_string()]);
    assert_eq!(outcome.modified, vec![b.to_string_lossy().to_string()]);
    assert!(outcome.added.is_empty());
    assert!(fx.library.get_song(&song_id(&a)).unwrap().is_none());
    assert_eq!(fx.library.stats().unwrap().songs, 1);
}

#[tokio::test]
async fn artist_spellings_resolve_to_one_row() {
    let fx = Fixture::new();
    fx.write("1.mp3", "title=Help\nartist=The Beatles\nalbum=Help!");
    fx.write("2.mp3", "title=Yesterday\nartist=the beatles\nalbum=help!");
    fx.write("3.mp3", "title=Something\nartist=  THE  BEATLES ");

    let outcome = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(outcome.counts.artists_created, 1);

    let (artists, total) = fx.library.list_artists(Some("beatles"), 10, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(artists[0].name, "The Beatles");
    assert_eq!(fx.library.list_albums(Some("help"), 10, 0).unwrap().1, 1);

    // A later scan reuses the stored spelling.
    fx.write("4.mp3", "title=Let It Be\nartist=THE BEATLES\nalbum=Let It Be");
    fx.library.scan(fx.full()).await.unwrap();
    let (artists, total) = fx.library.list_artists(Some("beatles"), 10, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(artists[0].name, "The Beatles");
}

#[tokio::test]
async fn split_credits_become_featured_artists() {
    let fx = Fixture::new();
    let path = fx.write("duet.mp3", "title=Duet\nartist=Alice feat. Bob;Carol\nalbum=Pairs");
    fx.library.scan(fx.full()).await.unwrap();

    let song = fx.library.get_song(&song_id(&path)).unwrap().unwrap();
    assert_eq!(song.artist_id, artist_id("Alice"));
    assert_eq!(
        song.featured_artist_ids,
        vec![artist_id("Bob"), artist_id("Carol")]
    );
    assert_eq!(fx.library.stats().unwrap().artists, 3);
}

#[tokio::test]
async fn orphaned_entities_are_purged_and_shared_ones_kept() {
    let fx = Fixture::new();
    let solo = fx.write("solo.mp3", "title=S\nartist=Solo\nalbum=Alone\ngenre=Jazz");
    fx.write("x.mp3", "title=X\nartist=Shared\nalbum=Both\ngenre=Rock");
    fx.write("y.mp3", "title=Y\nartist=Shared\nalbum=Both\ngenre=Rock");
    fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(fx.library.stats().unwrap().artists, 2);

    fs::remove_file(&solo).unwrap();
    let outcome = fx.library.scan(fx.full()).await.unwrap();

    let cleanup = outcome.cleanup.unwrap();
    assert_eq!(cleanup.songs_removed, 1);
    assert_eq!(cleanup.artists_removed, 1);
    assert_eq!(cleanup.albums_removed, 1);
    assert_eq!(cleanup.genres_removed, 1);
    assert!(fx.library.get_artist(&artist_id("Solo")).unwrap().is_none());
    assert!(fx.library.get_artist(&artist_id("Shared")).unwrap().is_some());
}

#[tokio::test]
async fn cancelled_scan_keeps_committed_batches_without_duplicates() {
    let fx = Fixture::new();
    for n in 0..10 {
        fx.write(&format!("{:02}.mp3", n), &format!("title=T{}\nartist=A\nalbum=B", n));
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let progress = move |report: &ProgressReport| {
        if report.phase == ScanPhase::Persisting && report.current >= 4 {
            trigger.cancel();
        }
    };
    let outcome = fx
        .library
        .scan(fx.full().with_cancel(cancel).with_progress(Arc::new(progress)))
        .await
        .unwrap();

    assert_eq!(outcome.status, ScanStatus::Cancelled);
    assert_eq!(outcome.counts.committed, 4);
    assert!(outcome.cleanup.is_none());
    assert_eq!(fx.library.stats().unwrap().songs, 4);

    let resumed = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(resumed.status, ScanStatus::Complete);
    assert_eq!(resumed.counts.added, 6);
    assert_eq!(resumed.counts.unchanged, 4);
    let stats = fx.library.stats().unwrap();
    assert_eq!(stats.songs, 10);
    assert_eq!(stats.artists, 1);
    assert_eq!(stats.albums, 1);
}

#[tokio::test]
async fn concurrent_scan_of_same_folder_is_rejected() {
    let fx = Fixture::new();
    fx.write("a.mp3", "title=A");

    let _guard = fx.library.begin_scan(&fx.root(), true).unwrap();
    match fx.library.scan(fx.full()).await {
        Err(LibraryError::ScanInProgress(_)) => {}
        other => panic!("expected rejection, got {:?}", other.map(|o| o.status)),
    }
}

#[tokio::test]
async fn extraction_failures_are_tallied_and_persisted() {
    let fx = Fixture::new();
    fx.write("good.mp3", "title=Good\nartist=A");
    let bad = fx.write("bad.mp3", "corrupt");

    let outcome = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(outcome.status, ScanStatus::CompleteWithErrors);
    assert_eq!(outcome.counts.failed, 1);
    assert_eq!(outcome.failures[0].path, bad.to_string_lossy());
    assert_eq!(fx.library.stats().unwrap().songs, 1);
    let (failures, total) = fx.library.list_scan_failures(10, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(failures[0].reason, outcome.failures[0].reason);

    fs::write(&bad, "title=Fixed\nartist=A").unwrap();
    let outcome = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(outcome.status, ScanStatus::Complete);
    assert_eq!(fx.library.list_scan_failures(10, 0).unwrap().1, 0);
    assert_eq!(fx.library.stats().unwrap().songs, 2);
}

#[tokio::test]
async fn missing_configuration_fails_before_scanning() {
    let fx = Fixture::new();
    fx.write("a.mp3", "title=A");

    let mut options = fx.options();
    options.artist_separators = None;
    let outcome = fx
        .library
        .scan(fx.full().with_options(options))
        .await
        .unwrap();
    assert_eq!(outcome.status, ScanStatus::Failed);
    assert!(outcome.error.unwrap().contains("separators"));

    let missing = ScanRequest::full(fx.dir.path().join("absent"))
        .with_options(fx.options())
        .with_tag_reader(Arc::new(TextTags));
    let outcome = fx.library.scan(missing).await.unwrap();
    assert_eq!(outcome.status, ScanStatus::Failed);
    assert_eq!(fx.library.stats().unwrap().songs, 0);
    assert!(!fx.library.is_scanning(&fx.root()));
}

#[tokio::test]
async fn targeted_scan_never_deletes() {
    let fx = Fixture::new();
    let a = fx.write("sub/a.mp3", "title=A\nartist=X");
    fx.write("sub/b.mp3", "title=B\nartist=X");
    fx.library.scan(fx.full()).await.unwrap();

    fs::remove_file(&a).unwrap();
    let c = fx.write("sub/c.mp3", "title=C\nartist=X");
    let outcome = fx
        .library
        .scan(fx.targeted(vec![fx.root().join("sub")]))
        .await
        .unwrap();

    assert_eq!(outcome.status, ScanStatus::Complete);
    assert_eq!(outcome.added, vec![c.to_string_lossy().to_string()]);
    assert!(outcome.removed.is_empty());
    assert_eq!(outcome.counts.deferred_removals, 1);
    assert!(fx.library.get_song(&song_id(&a)).unwrap().is_some());
    assert_eq!(fx.library.stats().unwrap().songs, 3);
}

#[tokio::test]
async fn modified_song_keeps_listening_history() {
    let fx = Fixture::new();
    let path = fx.write("a.mp3", "title=Draft\nartist=X");
    fx.library.scan(fx.full()).await.unwrap();
    let id = song_id(&path);
    assert!(fx.library.record_play(&id).unwrap());
    let before = fx.library.get_song(&id).unwrap().unwrap();

    fs::write(&path, "title=Final Title\nartist=X").unwrap();
    touch_later(&path);
    let outcome = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(outcome.counts.modified, 1);

    let after = fx.library.get_song(&id).unwrap().unwrap();
    assert_eq!(after.title, "Final Title");
    assert_eq!(after.play_count, 1);
    assert_eq!(after.last_played, before.last_played);
    assert_eq!(after.added_at, before.added_at);
}

#[tokio::test]
async fn embedded_cover_is_cached_and_adopted_by_album() {
    let fx = Fixture::new();
    let path = fx.write("a.mp3", "title=A\nartist=X\nalbum=Art\ncover=pixels");
    fx.write("b.mp3", "title=B\nartist=X\nalbum=Art\ncover=pixels");
    fx.library.scan(fx.full()).await.unwrap();

    let song = fx.library.get_song(&song_id(&path)).unwrap().unwrap();
    let cover = song.cover_art_path.clone().unwrap();
    assert!(Path::new(&cover).starts_with(fx.dir.path().join("cache").join("covers")));
    assert_eq!(fs::read(&cover).unwrap(), b"pixels");

    let album = fx.library.get_album(&song.album_id).unwrap().unwrap();
    assert_eq!(album.art_path, Some(cover));
    let cached = fs::read_dir(fx.dir.path().join("cache").join("covers"))
        .unwrap()
        .count();
    assert_eq!(cached, 1);
}

#[tokio::test]
async fn folder_removal_requires_cascade() {
    let fx = Fixture::new();
    fx.write("a.mp3", "title=A\nartist=X");
    fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(fx.library.list_folders().unwrap().len(), 1);
    assert!(fx.library.list_folders().unwrap()[0].last_scanned_at.is_some());

    assert!(matches!(
        fx.library.remove_folder(&fx.root(), false),
        Err(LibraryError::FolderNotEmpty(_, 1))
    ));
    fx.library.remove_folder(&fx.root(), true).unwrap();
    let stats = fx.library.stats().unwrap();
    assert_eq!(stats.folders, 0);
    assert_eq!(stats.songs, 0);
    assert_eq!(stats.artists, 0);
    assert_eq!(stats.albums, 0);
}

#[tokio::test]
async fn halted_batch_failure_keeps_earlier_batches() {
    let fx = Fixture::new();
    for n in 0..10 {
        fx.write(&format!("{:02}.mp3", n), &format!("title=T{}\nartist=A\nalbum=B", n));
    }

    let sink = Arc::new(FlakySink {
        catalog: fx.library.catalog().clone(),
        fail_on: 3,
        calls: AtomicUsize::new(0),
    });
    let mut options = fx.options();
    options.failure_policy = BatchFailurePolicy::Halt;
    let request = fx.full().with_options(options).with_batch_sink(sink.clone());
    let outcome = fx.library.scan(request).await.unwrap();

    assert_eq!(outcome.status, ScanStatus::CompleteWithErrors);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.batch_failures.len(), 1);
    assert_eq!(outcome.batch_failures[0].index, 3);
    assert_eq!(outcome.counts.committed, 4);
    assert_eq!(outcome.counts.unattempted, 4);
    assert_eq!(fx.library.stats().unwrap().songs, 4);

    let retried = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(retried.status, ScanStatus::Complete);
    assert_eq!(retried.counts.added, 6);
    assert_eq!(fx.library.stats().unwrap().songs, 10);
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_directory_keeps_its_songs() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    fx.write("top.mp3", "title=Top\nartist=A");
    let gone = fx.write("gone.mp3", "title=Gone\nartist=A");
    fx.write("sub/a.mp3", "title=SubA\nartist=B");
    fx.write("sub/b.mp3", "title=SubB\nartist=B");
    let first = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(first.counts.added, 4);

    let sub = fx.root().join("sub");
    let song = fx
        .library
        .catalog()
        .get_song_by_path(&sub.join("a.mp3"))
        .unwrap()
        .unwrap();
    fx.library.record_play(&song.id).unwrap();
    fs::remove_file(&gone).unwrap();
    fs::set_permissions(&sub, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&sub).is_ok() {
        // Privileged users read through the mode bits.
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let second = fx.library.scan(fx.full()).await;
    fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();
    let second = second.unwrap();

    assert_eq!(second.status, ScanStatus::CompleteWithErrors);
    assert_eq!(second.walk_warnings.len(), 1);
    assert_eq!(second.removed, vec![gone.to_string_lossy().to_string()]);
    assert_eq!(fx.library.stats().unwrap().songs, 3);
    assert_eq!(fx.library.get_song(&song.id).unwrap().unwrap().play_count, 1);
    assert!(fx.library.get_artist(&artist_id("B")).unwrap().is_some());

    let third = fx.library.scan(fx.full()).await.unwrap();
    assert_eq!(third.status, ScanStatus::Complete);
    assert_eq!(third.counts.unchanged, 3);
    assert!(third.removed.is_empty());
}
