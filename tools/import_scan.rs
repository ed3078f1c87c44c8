use std::env;
use std::path::PathBuf;

use library::{Library, ScanOptions, ScanRequest};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: import_scan <music_root> [index_path]; \
set ARTIST_SEPARATORS to a '|'-delimited list, e.g. ';| feat. '";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or(USAGE)?;
    let index_path = args
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/catalog.redb".to_string());
    let separators = env::var("ARTIST_SEPARATORS")
        .ok()
        .map(|value| value.split('|').map(str::to_string).collect::<Vec<_>>())
        .ok_or(USAGE)?;

    let index_path = PathBuf::from(index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let library = Library::open(&index_path)?;
    let options = ScanOptions {
        artist_separators: Some(separators),
        cover_cache_dir: index_path.parent().map(|dir| dir.join("cache")),
        ..ScanOptions::default()
    };
    let outcome = library
        .scan(ScanRequest::full(PathBuf::from(&music_root)).with_options(options))
        .await?;

    for failure in &outcome.failures {
        warn!("{}: {}", failure.path, failure.reason);
    }
    if let Some(error) = &outcome.error {
        warn!("{}", error);
    }
    let stats = library.stats()?;
    println!(
        "Scan {}: {} added, {} modified, {} removed, {} failed; catalog has {} artists, {} albums, {} songs",
        outcome.status.as_str(),
        outcome.counts.added,
        outcome.counts.modified,
        outcome.counts.removed,
        outcome.counts.failed,
        stats.artists,
        stats.albums,
        stats.songs
    );

    Ok(())
}
