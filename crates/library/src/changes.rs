use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use common::{path_key, path_within};

use crate::store::SongStamp;
use crate::walker::FileStat;

/// What part of a folder a walk covered. Subtrees the walk could not read
/// are never covered, even by a full walk.
#[derive(Clone, Copy, Debug)]
pub struct Coverage<'a> {
    /// `None` when the whole folder was walked.
    paths: Option<&'a [PathBuf]>,
    unreadable: &'a [PathBuf],
}

impl<'a> Coverage<'a> {
    /// The whole folder was walked; missing rows are confirmed removals.
    pub fn folder() -> Self {
        Self {
            paths: None,
            unreadable: &[],
        }
    }

    /// Only these files or subtrees were walked.
    pub fn paths(paths: &'a [PathBuf]) -> Self {
        Self {
            paths: Some(paths),
            unreadable: &[],
        }
    }

    /// Excludes subtrees the walk failed to enumerate.
    pub fn skipping(mut self, unreadable: &'a [PathBuf]) -> Self {
        self.unreadable = unreadable;
        self
    }

    pub fn is_full(&self) -> bool {
        self.paths.is_none()
    }

    fn covers(&self, path: &Path) -> bool {
        if self.unreadable.iter().any(|dir| path_within(path, dir)) {
            return false;
        }
        match self.paths {
            None => true,
            Some(paths) => paths.iter().any(|root| path_within(path, root)),
        }
    }
}

/// Four disjoint classifications of one walk against the catalog.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub added: Vec<FileStat>,
    pub modified: Vec<FileStat>,
    pub unchanged: Vec<FileStat>,
    /// Catalog rows inside the walk's coverage that the walk did not see.
    pub removed: Vec<SongStamp>,
}

impl ChangeSet {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Files that need tag extraction, in walk order.
    pub fn to_extract(&self) -> impl Iterator<Item = &FileStat> {
        self.added.iter().chain(self.modified.iter())
    }
}

/// Classifies `files` against `snapshot`, the folder's rows keyed by
/// [`path_key`]. Rows outside `coverage` are never reported as removed.
pub fn detect_changes(
    files: Vec<FileStat>,
    mut snapshot: HashMap<String, SongStamp>,
    coverage: Coverage<'_>,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut seen = HashSet::new();

    for file in files {
        let key = path_key(&file.path);
        if !seen.insert(key.clone()) {
            continue;
        }
        match snapshot.remove(&key) {
            None => changes.added.push(file),
            Some(stored) => {
                if stored.modified_ms != file.modified_ms || stored.file_size != file.size {
                    changes.modified.push(file);
                } else {
                    changes.unchanged.push(file);
                }
            }
        }
    }

    let mut removed: Vec<SongStamp> = snapshot
        .into_values()
        .filter(|stamp| coverage.covers(Path::new(&stamp.path)))
        .collect();
    removed.sort_by(|a, b| a.path.cmp(&b.path));
    changes.removed = removed;
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(path: &str, modified_ms: i64, size: u64) -> FileStat {
        FileStat {
            path: PathBuf::from(path),
            modified_ms,
            size,
        }
    }

    fn stamp(path: &str, modified_ms: i64, file_size: u64) -> (String, SongStamp) {
        (
            path_key(Path::new(path)),
            SongStamp {
                song_id: format!("id:{}", path),
                path: path.to_string(),
                modified_ms,
                file_size,
            },
        )
    }

    #[test]
    fn classifies_into_disjoint_sets() {
        let snapshot: HashMap<_, _> = [
            stamp("/m/a.mp3", 10, 100),
            stamp("/m/b.mp3", 10, 100),
            stamp("/m/c.mp3", 10, 100),
            stamp("/m/d.mp3", 10, 100),
        ]
        .into_iter()
        .collect();
        let files = vec![
            stat("/m/b.mp3", 20, 100),
            stat("/m/c.mp3", 10, 101),
            stat("/m/d.mp3", 10, 100),
            stat("/m/e.mp3", 10, 100),
        ];

        let changes = detect_changes(files, snapshot, Coverage::folder());
        assert_eq!(changes.added, vec![stat("/m/e.mp3", 10, 100)]);
        assert_eq!(changes.modified.len(), 2);
        assert_eq!(changes.unchanged, vec![stat("/m/d.mp3", 10, 100)]);
        assert_eq!(changes.removed.len(), 1);
        assert_eq!(changes.removed[0].path, "/m/a.mp3");
        assert!(!changes.is_clean());
    }

    #[test]
    fn targeted_walk_only_reports_removals_inside_its_paths() {
        let snapshot: HashMap<_, _> = [
            stamp("/m/x/1.mp3", 1, 1),
            stamp("/m/x/2.mp3", 1, 1),
            stamp("/m/y/1.mp3", 1, 1),
            stamp("/m/xy/1.mp3", 1, 1),
        ]
        .into_iter()
        .collect();
        let covered = vec![PathBuf::from("/m/x")];
        let changes = detect_changes(
            vec![stat("/m/x/1.mp3", 1, 1)],
            snapshot,
            Coverage::paths(&covered),
        );

        let removed: Vec<&str> = changes.removed.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(removed, vec!["/m/x/2.mp3"]);
        assert_eq!(changes.unchanged.len(), 1);
    }

    #[test]
    fn unchanged_walk_is_clean() {
        let snapshot: HashMap<_, _> = [stamp("/m/a.mp3", 5, 9)].into_iter().collect();
        let changes = detect_changes(vec![stat("/m/a.mp3", 5, 9)], snapshot, Coverage::folder());
        assert!(changes.is_clean());
        assert_eq!(changes.to_extract().count(), 0);
    }

    #[test]
    fn duplicate_walk_entries_count_once() {
        let files = vec![stat("/m/a.mp3", 1, 1), stat("/m/a.mp3", 1, 1)];
        let changes = detect_changes(files, HashMap::new(), Coverage::folder());
        assert_eq!(changes.added.len(), 1);
    }

    #[test]
    fn unreadable_subtrees_are_never_removed() {
        let snapshot: HashMap<_, _> = [
            stamp("/m/top.mp3", 1, 1),
            stamp("/m/gone.mp3", 1, 1),
            stamp("/m/sub/a.mp3", 1, 1),
            stamp("/m/sub/b.mp3", 1, 1),
        ]
        .into_iter()
        .collect();
        let unreadable = vec![PathBuf::from("/m/sub")];
        let changes = detect_changes(
            vec![stat("/m/top.mp3", 1, 1)],
            snapshot,
            Coverage::folder().skipping(&unreadable),
        );

        let removed: Vec<&str> = changes.removed.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(removed, vec!["/m/gone.mp3"]);
    }
}
