use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::warn;
use walkdir::WalkDir;

/// Extensions the tag reader understands, lowercase.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "mp4", "aac", "wav", "aif", "aiff", "ape", "wv",
    "mpc", "spx",
];

/// A discovered audio file, stat'ed but not opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub path: PathBuf,
    pub modified_ms: i64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkWarning {
    pub path: Option<PathBuf>,
    pub message: String,
}

/// Walk configuration over one or more roots. Each call to [`files`]
/// starts a fresh enumeration.
///
/// [`files`]: AudioWalker::files
#[derive(Clone, Debug)]
pub struct AudioWalker {
    roots: Vec<PathBuf>,
    follow_links: bool,
}

impl AudioWalker {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            follow_links: false,
        }
    }

    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    pub fn files(&self) -> AudioFiles {
        AudioFiles {
            roots: self.roots.clone().into_iter(),
            current: None,
            follow_links: self.follow_links,
            warnings: Vec::new(),
        }
    }
}

/// Lazy, depth-first enumeration in file-name order. Dropping it releases
/// any directory handles still open.
pub struct AudioFiles {
    roots: std::vec::IntoIter<PathBuf>,
    current: Option<walkdir::IntoIter>,
    follow_links: bool,
    warnings: Vec<WalkWarning>,
}

impl AudioFiles {
    pub fn warnings(&self) -> &[WalkWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<WalkWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn record(&mut self, path: Option<PathBuf>, message: String) {
        warn!("Skipping {:?}: {}", path, message);
        self.warnings.push(WalkWarning { path, message });
    }
}

impl Iterator for AudioFiles {
    type Item = FileStat;

    fn next(&mut self) -> Option<FileStat> {
        loop {
            let walker = match self.current.as_mut() {
                Some(walker) => walker,
                None => {
                    let root = self.roots.next()?;
                    self.current = Some(
                        WalkDir::new(root)
                            .follow_links(self.follow_links)
                            .sort_by_file_name()
                            .into_iter(),
                    );
                    continue;
                }
            };

            let entry = match walker.next() {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    let path = err.path().map(Path::to_path_buf);
                    self.record(path, err.to_string());
                    continue;
                }
                None => {
                    self.current = None;
                    continue;
                }
            };

            if !entry.file_type().is_file() || !is_supported(entry.path()) {
                continue;
            }

            match entry.metadata() {
                Ok(meta) => {
                    return Some(FileStat {
                        modified_ms: modified_ms(&meta),
                        size: meta.len(),
                        path: entry.into_path(),
                    });
                }
                Err(err) => {
                    let path = Some(entry.path().to_path_buf());
                    self.record(path, err.to_string());
                }
            }
        }
    }
}

pub fn is_supported(path: &Path) -> bool {
    let ext = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
        None => return false,
    };
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

/// Last-write time in milliseconds since the epoch; negative before it.
pub fn modified_ms(meta: &Metadata) -> i64 {
    let modified = match meta.modified() {
        Ok(modified) => modified,
        Err(_) => return 0,
    };
    match modified.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis() as i64,
        Err(err) => -(err.duration().as_millis() as i64),
    }
}

/// Stats a single path the same way the walker does.
pub fn stat_file(path: &Path) -> std::io::Result<FileStat> {
    let meta = std::fs::metadata(path)?;
    Ok(FileStat {
        path: path.to_path_buf(),
        modified_ms: modified_ms(&meta),
        size: meta.len(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn touch(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn walks_audio_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("b.mp3"), b"bb");
        touch(&root.join("A.FLAC"), b"a");
        touch(&root.join("notes.txt"), b"skip");
        touch(&root.join("disc 1/01.ogg"), b"ccc");
        touch(&root.join("noext"), b"skip");

        let files: Vec<FileStat> = AudioWalker::new([root]).files().collect();
        let names: Vec<PathBuf> = files
            .iter()
            .map(|file| file.path.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("A.FLAC"),
                PathBuf::from("b.mp3"),
                PathBuf::from("disc 1").join("01.ogg"),
            ]
        );
        assert_eq!(files[1].size, 2);
        assert!(files[1].modified_ms > 0);
    }

    #[test]
    fn enumeration_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.mp3"), b"a");
        touch(&dir.path().join("b.mp3"), b"b");

        let walker = AudioWalker::new([dir.path()]);
        let first: Vec<FileStat> = walker.files().take(1).collect();
        let second: Vec<FileStat> = walker.files().collect();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert_eq!(first[0], second[0]);
    }

    #[test]
    fn missing_root_is_a_warning_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("present/a.mp3"), b"a");

        let walker = AudioWalker::new([dir.path().join("absent"), dir.path().join("present")]);
        let mut files = walker.files();
        let found: Vec<FileStat> = files.by_ref().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(files.warnings().len(), 1);
        assert_eq!(
            files.warnings()[0].path.as_deref(),
            Some(dir.path().join("absent").as_path())
        );
    }

    #[test]
    fn file_roots_are_yielded_directly() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("single.flac");
        touch(&file, b"abc");
        let found: Vec<FileStat> = AudioWalker::new([&file]).files().collect();
        assert_eq!(found, vec![stat_file(&file).unwrap()]);
    }
}
