use crate::compactor::{
    CompactionError, CompactionReport, SyncDirectoryCompactor, list_sessions,
    next_session_index, session_name,
};
use crate::registry::JobId;
use crate::workspace::WorkspaceLayout;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Top-level file that only a single fuzzer session directory contains.
const SINGLE_SESSION_MARKER: &str = "fuzzer_stats";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Job {0} has no sync directory")]
    JobNotFound(JobId),

    #[error("{path:?} is not a readable tar archive: {message}")]
    MalformedArchive { path: PathBuf, message: String },

    #[error("Archive I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Compaction(#[from] CompactionError),
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        ArchiveError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Session directories created in the sync directory, in creation order.
    pub sessions: Vec<String>,
    pub compaction: CompactionReport,
}

/// Moves fuzzer sessions in and out of a job's sync directory as tar bundles.
pub struct ImportExport<'a> {
    layout: &'a WorkspaceLayout,
    compactor: SyncDirectoryCompactor,
}

impl<'a> ImportExport<'a> {
    pub fn new(layout: &'a WorkspaceLayout, compactor: SyncDirectoryCompactor) -> Self {
        Self { layout, compactor }
    }

    pub fn import(&self, id: &JobId, archive: &Path) -> Result<ImportReport, ArchiveError> {
        let sync_dir = self.layout.afl_out(id);
        if !sync_dir.is_dir() {
            return Err(ArchiveError::JobNotFound(id.clone()));
        }

        let top_level = top_level_entries(archive)?;
        let mut report = ImportReport::default();

        if top_level.iter().any(|name| name == SINGLE_SESSION_MARKER) {
            let name = session_name(next_session_index(&sync_dir)?);
            let dest = sync_dir.join(&name);
            fs::create_dir(&dest)?;
            unpack(archive, &dest)?;
            log::info!("imported single session {} into {}", archive.display(), name);
            report.sessions.push(name);
        } else {
            let scratch = tempfile::Builder::new()
                .prefix(".import-")
                .tempdir_in(self.layout.job_dir(id))?;
            unpack(archive, scratch.path())?;

            let mut dirs = Vec::new();
            for entry in fs::read_dir(scratch.path())? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    dirs.push(entry);
                }
            }
            dirs.sort_by_key(|e| e.file_name());

            let mut index = next_session_index(&sync_dir)?;
            for entry in dirs {
                let name = session_name(index);
                fs::rename(entry.path(), sync_dir.join(&name))?;
                log::info!(
                    "imported {} as {}",
                    entry.file_name().to_string_lossy(),
                    name
                );
                report.sessions.push(name);
                index += 1;
            }
            // `scratch` is removed on drop together with any top-level plain files.
        }

        report.compaction = self.compactor.compact(&sync_dir)?;
        Ok(report)
    }

    /// Compacts the job and writes its sessions as a multi-session tar bundle.
    pub fn export(&self, id: &JobId, dest: &Path) -> Result<PathBuf, ArchiveError> {
        let sync_dir = self.layout.afl_out(id);
        if !sync_dir.is_dir() {
            return Err(ArchiveError::JobNotFound(id.clone()));
        }
        self.compactor.compact(&sync_dir)?;

        let file = File::create(dest)?;
        let mut builder = tar::Builder::new(file);
        for (index, path) in list_sessions(&sync_dir)? {
            builder.append_dir_all(session_name(index), &path)?;
        }
        builder.into_inner()?;
        log::info!("exported job {} to {}", id, dest.display());
        Ok(dest.to_path_buf())
    }
}

fn malformed(path: &Path, err: impl ToString) -> ArchiveError {
    ArchiveError::MalformedArchive {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Names of the first path component of every entry, with `./` prefixes ignored.
fn top_level_entries(archive: &Path) -> Result<Vec<String>, ArchiveError> {
    let file = File::open(archive).map_err(|e| malformed(archive, e))?;
    let mut reader = tar::Archive::new(file);
    let mut names = Vec::new();
    let mut seen_any = false;

    for entry in reader.entries().map_err(|e| malformed(archive, e))? {
        let entry = entry.map_err(|e| malformed(archive, e))?;
        seen_any = true;
        let path = entry.path().map_err(|e| malformed(archive, e))?;
        let first = path
            .components()
            .find(|c| !matches!(c, Component::CurDir))
            .map(|c| c.as_os_str().to_string_lossy().into_owned());
        if let Some(first) = first {
            if !names.contains(&first) {
                names.push(first);
            }
        }
    }

    if !seen_any {
        return Err(malformed(archive, "archive contains no entries"));
    }
    Ok(names)
}

fn unpack(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive)?;
    tar::Archive::new(file)
        .unpack(dest)
        .map_err(|e| malformed(archive, e))
}
