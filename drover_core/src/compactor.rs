use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SESSION_PREFIX: &str = "SESSION";

/// Directories merged from every session into the canonical one.
const MERGED_DIRS: [&str; 3] = ["crashes", "hangs", "queue"];

#[derive(Error, Debug)]
pub enum CompactionError {
    #[error("Sync directory {0:?} does not exist")]
    MissingSyncDir(PathBuf),

    #[error("Compaction I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for CompactionError {
    fn from(err: io::Error) -> Self {
        CompactionError::Io(err.to_string())
    }
}

/// What happens when a file being merged already exists at the destination.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Keep the destination file; the source is deleted with its parent.
    #[default]
    DropOnCollision,
    /// Move the source under `<name>,<n>` using the smallest free `n`.
    RenameOnCollision,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub files_moved: usize,
    pub collisions_dropped: usize,
    pub collisions_renamed: usize,
    pub stray_files_removed: usize,
    pub shards_removed: usize,
    pub sessions_merged: usize,
}

impl CompactionReport {
    pub fn is_noop(&self) -> bool {
        *self == CompactionReport::default()
    }
}

/// Numeric index of a session directory name such as `SESSION007`.
pub fn session_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(SESSION_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn session_name(index: u32) -> String {
    format!("{SESSION_PREFIX}{index:03}")
}

/// Session directories of `sync_dir`, ordered by index.
pub fn list_sessions(sync_dir: &Path) -> Result<Vec<(u32, PathBuf)>, io::Error> {
    let mut sessions = Vec::new();
    for entry in fs::read_dir(sync_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(index) = session_index(&entry.file_name().to_string_lossy()) {
            sessions.push((index, entry.path()));
        }
    }
    sessions.sort_by_key(|(index, _)| *index);
    Ok(sessions)
}

/// Index for a new session slot: one past the highest existing index, or 0.
pub fn next_session_index(sync_dir: &Path) -> Result<u32, io::Error> {
    Ok(list_sessions(sync_dir)?
        .last()
        .map_or(0, |(index, _)| index + 1))
}

/// Folds a multi-session sync directory into `SESSION000`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncDirectoryCompactor {
    policy: CollisionPolicy,
}

impl SyncDirectoryCompactor {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self { policy }
    }

    pub fn compact(&self, sync_dir: &Path) -> Result<CompactionReport, CompactionError> {
        if !sync_dir.is_dir() {
            return Err(CompactionError::MissingSyncDir(sync_dir.to_path_buf()));
        }
        let mut report = CompactionReport::default();
        self.remove_stray_files(sync_dir, &mut report)?;

        let sessions = list_sessions(sync_dir)?;
        for (_, session) in &sessions {
            self.flatten_session(session, &mut report)?;
        }

        let canonical = sync_dir.join(session_name(0));
        for (index, session) in sessions {
            if index == 0 {
                continue;
            }
            for sub in MERGED_DIRS {
                let src = session.join(sub);
                if src.is_dir() {
                    self.move_files(&src, &canonical.join(sub), &mut report)?;
                }
            }
            fs::remove_dir_all(&session)?;
            report.sessions_merged += 1;
        }

        if !report.is_noop() {
            log::info!("compacted {}: {:?}", sync_dir.display(), report);
        }
        Ok(report)
    }

    /// Removes plain files sitting directly in the sync directory.
    fn remove_stray_files(
        &self,
        sync_dir: &Path,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        for entry in fs::read_dir(sync_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            fs::remove_file(entry.path())?;
            report.stray_files_removed += 1;
        }
        Ok(())
    }

    /// Folds `crashes.*` and `hangs.*` shards back into their base directory.
    /// Session-level files such as `fuzzer_stats` stay in place.
    fn flatten_session(
        &self,
        session: &Path,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        let mut entries = fs::read_dir(session)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let target = if name.starts_with("crashes.") {
                "crashes"
            } else if name.starts_with("hangs.") {
                "hangs"
            } else {
                continue;
            };
            self.move_files(&path, &session.join(target), report)?;
            fs::remove_dir_all(&path)?;
            report.shards_removed += 1;
        }
        Ok(())
    }

    /// Moves the regular files of `src` into `dst`. Subdirectories are left alone.
    fn move_files(
        &self,
        src: &Path,
        dst: &Path,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        fs::create_dir_all(dst)?;
        let mut files: Vec<_> = fs::read_dir(src)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .collect();
        files.sort_by_key(|e| e.file_name());

        for entry in files {
            let name = entry.file_name();
            let mut target = dst.join(&name);
            if target.exists() {
                match self.policy {
                    CollisionPolicy::DropOnCollision => {
                        report.collisions_dropped += 1;
                        continue;
                    }
                    CollisionPolicy::RenameOnCollision => {
                        target = free_suffixed_path(dst, &name.to_string_lossy());
                        report.collisions_renamed += 1;
                    }
                }
            } else {
                report.files_moved += 1;
            }
            fs::rename(entry.path(), &target)?;
        }
        Ok(())
    }
}

fn free_suffixed_path(dir: &Path, name: &str) -> PathBuf {
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{name},{n}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::count_visible_entries;
    use tempfile::tempdir;

    fn touch(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[yare::parameterized(
        zero = { "SESSION000", Some(0) },
        padded = { "SESSION007", Some(7) },
        wide = { "SESSION1234", Some(1234) },
        bare = { "SESSION", None },
        suffix = { "SESSION01a", None },
        coverage = { "cov", None },
    )]
    fn parses_session_names(name: &str, expected: Option<u32>) {
        assert_eq!(session_index(name), expected);
    }

    #[test]
    fn sessions_are_ordered_numerically() {
        let dir = tempdir().unwrap();
        for name in ["SESSION10", "SESSION002", "SESSION1", "cov"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        let indices: Vec<u32> = list_sessions(dir.path())
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(indices, vec![1, 2, 10]);
        assert_eq!(next_session_index(dir.path()).unwrap(), 11);
    }

    #[test]
    fn next_index_of_empty_sync_dir_is_zero() {
        let dir = tempdir().unwrap();
        assert_eq!(next_session_index(dir.path()).unwrap(), 0);
    }

    #[test]
    fn flattens_shards_and_merges_sessions() {
        let dir = tempdir().unwrap();
        let sync = dir.path();
        touch(&sync.join("SESSION000/fuzzer_stats"), b"stats");
        touch(&sync.join("SESSION000/queue/id:000000"), b"a");
        touch(&sync.join("SESSION000/crashes.2024-01-01/id:000000"), b"c0");
        touch(&sync.join("SESSION001/queue/id:000001"), b"b");
        touch(&sync.join("SESSION001/queue/.state/auto_extras/x"), b"s");
        touch(&sync.join("SESSION001/hangs.old/id:000009"), b"h");
        touch(&sync.join("SESSION001/crashes/id:000003"), b"c3");
        touch(&sync.join(".cur_input_asan"), b"in");
        touch(&sync.join("stray.log"), b"log");
        fs::create_dir_all(sync.join("cov/web")).unwrap();

        let compactor = SyncDirectoryCompactor::default();
        let report = compactor.compact(sync).unwrap();

        assert_eq!(report.sessions_merged, 1);
        assert_eq!(report.shards_removed, 2);
        assert_eq!(report.stray_files_removed, 2);
        assert_eq!(report.collisions_dropped, 0);
        assert!(!sync.join(".cur_input_asan").exists());
        assert!(!sync.join("stray.log").exists());

        let canonical = sync.join("SESSION000");
        assert!(canonical.join("crashes/id:000000").is_file());
        assert!(canonical.join("crashes/id:000003").is_file());
        assert!(canonical.join("hangs/id:000009").is_file());
        assert_eq!(count_visible_entries(&canonical.join("queue")), 2);
        assert!(!canonical.join("queue/.state").exists());
        assert_eq!(fs::read(canonical.join("fuzzer_stats")).unwrap(), b"stats");
        assert!(!sync.join("SESSION001").exists());
        assert!(sync.join("cov/web").is_dir());
    }

    #[test]
    fn second_pass_is_a_noop() {
        let dir = tempdir().unwrap();
        let sync = dir.path();
        touch(&sync.join("SESSION000/queue/id:000000"), b"a");
        touch(&sync.join("SESSION003/queue/id:000001"), b"b");
        touch(&sync.join("SESSION003/fuzzer_stats"), b"s");

        let compactor = SyncDirectoryCompactor::default();
        assert!(!compactor.compact(sync).unwrap().is_noop());
        assert!(compactor.compact(sync).unwrap().is_noop());
        assert_eq!(count_visible_entries(&sync.join("SESSION000/queue")), 2);
    }

    #[test]
    fn shard_collision_is_dropped_with_the_shard() {
        let dir = tempdir().unwrap();
        let sync = dir.path();
        touch(&sync.join("SESSION000/crashes/id:4"), b"kept");
        touch(&sync.join("SESSION000/crashes.2023-12-31/id:4"), b"shard");
        touch(&sync.join("SESSION000/crashes.2023-12-31/id:5"), b"new");

        let report = SyncDirectoryCompactor::default().compact(sync).unwrap();
        assert_eq!(report.collisions_dropped, 1);
        assert_eq!(report.files_moved, 1);
        assert_eq!(report.shards_removed, 1);

        let crashes = sync.join("SESSION000/crashes");
        assert_eq!(fs::read(crashes.join("id:4")).unwrap(), b"kept");
        assert!(crashes.join("id:5").is_file());
        assert!(!sync.join("SESSION000/crashes.2023-12-31").exists());
    }

    #[test]
    fn resumes_after_an_interrupted_pass() {
        let dir = tempdir().unwrap();
        let sync = dir.path();
        // SESSION001 lost id:1 to the canonical queue before the pass stopped.
        touch(&sync.join("SESSION000/queue/id:0"), b"a");
        touch(&sync.join("SESSION000/queue/id:1"), b"b");
        touch(&sync.join("SESSION001/queue/id:2"), b"c");
        touch(&sync.join("SESSION001/fuzzer_stats"), b"s");
        // A shard that was only partly emptied.
        touch(&sync.join("SESSION000/hangs/id:7"), b"h7");
        touch(&sync.join("SESSION000/hangs.old/id:8"), b"h8");

        let compactor = SyncDirectoryCompactor::default();
        let report = compactor.compact(sync).unwrap();
        assert_eq!(report.collisions_dropped, 0);
        assert_eq!(report.sessions_merged, 1);

        let canonical = sync.join("SESSION000");
        assert_eq!(count_visible_entries(&canonical.join("queue")), 3);
        assert_eq!(count_visible_entries(&canonical.join("hangs")), 2);
        assert!(!sync.join("SESSION001").exists());
        assert!(!canonical.join("hangs.old").exists());

        assert!(compactor.compact(sync).unwrap().is_noop());
        assert_eq!(count_visible_entries(&canonical.join("queue")), 3);
    }

    #[test]
    fn collision_is_dropped_by_default() {
        let dir = tempdir().unwrap();
        let sync = dir.path();
        touch(&sync.join("SESSION000/crashes/id:1"), b"first");
        touch(&sync.join("SESSION001/crashes/id:1"), b"second");

        let report = SyncDirectoryCompactor::default().compact(sync).unwrap();
        assert_eq!(report.collisions_dropped, 1);
        assert_eq!(
            fs::read(sync.join("SESSION000/crashes/id:1")).unwrap(),
            b"first"
        );
        assert_eq!(count_visible_entries(&sync.join("SESSION000/crashes")), 1);
    }

    #[test]
    fn collision_can_be_renamed() {
        let dir = tempdir().unwrap();
        let sync = dir.path();
        touch(&sync.join("SESSION000/crashes/id:1"), b"first");
        touch(&sync.join("SESSION000/crashes/id:1,1"), b"taken");
        touch(&sync.join("SESSION001/crashes/id:1"), b"second");

        let compactor = SyncDirectoryCompactor::new(CollisionPolicy::RenameOnCollision);
        let report = compactor.compact(sync).unwrap();
        assert_eq!(report.collisions_renamed, 1);
        assert_eq!(
            fs::read(sync.join("SESSION000/crashes/id:1,2")).unwrap(),
            b"second"
        );
    }

    #[test]
    fn canonical_session_is_created_when_absent() {
        let dir = tempdir().unwrap();
        let sync = dir.path();
        touch(&sync.join("SESSION002/queue/id:000000"), b"a");

        SyncDirectoryCompactor::default().compact(sync).unwrap();
        assert!(sync.join("SESSION000/queue/id:000000").is_file());
        assert!(!sync.join("SESSION002").exists());
    }

    #[test]
    fn missing_sync_dir_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            SyncDirectoryCompactor::default().compact(&dir.path().join("nope")),
            Err(CompactionError::MissingSyncDir(_))
        ));
    }
}
