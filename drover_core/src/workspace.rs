use crate::registry::JobId;
use crate::variant::Variant;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Format used for archive and backup names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Workspace already exists at {0:?}")]
    AlreadyExists(PathBuf),

    #[error("No workspace found at {0:?}")]
    Missing(PathBuf),

    #[error("Workspace I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for WorkspaceError {
    fn from(err: io::Error) -> Self {
        WorkspaceError::Io(err.to_string())
    }
}

/// The on-disk directory schema every component reads and writes through.
///
/// This is a plain path value. It is handed to each component explicitly so that
/// several workspaces can coexist in one process (tests rely on that).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binaries_dir(&self) -> PathBuf {
        self.root.join("binaries")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.jobs_dir().join("jobs.toml")
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.logs_dir().join(name)
    }

    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.jobs_dir().join(id.as_str())
    }

    pub fn afl_in(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("afl-in")
    }

    /// The job's sync directory.
    pub fn afl_out(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("afl-out")
    }

    pub fn exploitable_dir(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("exploitable")
    }

    pub fn unique_dir(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("unique")
    }

    pub fn job_archive_dir(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("archive")
    }

    pub fn collect_dir(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join("collect")
    }

    pub fn worker_config(&self, id: &JobId, variant: Variant) -> PathBuf {
        self.job_dir(id).join(format!("{}-job.conf", variant.name()))
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Creates the directory tree. Never reuses an existing workspace.
    pub fn create(&self) -> Result<(), WorkspaceError> {
        if self.root.exists() {
            return Err(WorkspaceError::AlreadyExists(self.root.clone()));
        }
        fs::create_dir_all(&self.root)?;
        for dir in [
            self.binaries_dir(),
            self.conf_dir(),
            self.logs_dir(),
            self.jobs_dir(),
            self.archive_dir(),
        ] {
            fs::create_dir(&dir)?;
        }
        log::info!("created workspace at {}", self.root.display());
        Ok(())
    }

    pub fn ensure_exists(&self) -> Result<(), WorkspaceError> {
        if self.binaries_dir().is_dir() {
            Ok(())
        } else {
            Err(WorkspaceError::Missing(self.root.clone()))
        }
    }

    /// Removes the whole tree. Returns `false` if there was nothing to remove.
    pub fn destroy(&self) -> Result<bool, WorkspaceError> {
        if !self.root.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&self.root)?;
        Ok(true)
    }
}

/// Current local time in [`TIMESTAMP_FORMAT`].
pub fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Returns `parent/<name>` where `name` is built by `make_name` from a fresh timestamp.
/// A `.1`, `.2`, ... suffix is appended until the path is free.
pub fn unique_timestamped_path(parent: &Path, make_name: impl Fn(&str) -> String) -> PathBuf {
    let base = make_name(&timestamp());
    let mut candidate = parent.join(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = parent.join(format!("{base}.{n}"));
        n += 1;
    }
    candidate
}

/// Number of non-hidden entries in `dir`, or 0 if it cannot be read.
pub fn count_visible_entries(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .count()
        })
        .unwrap_or(0)
}

pub fn is_empty_dir(dir: &Path) -> Result<bool, io::Error> {
    Ok(fs::read_dir(dir)?.next().is_none())
}
