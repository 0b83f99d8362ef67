use crate::fingerprint::FingerprintAlgorithm;
use crate::workspace::{WorkspaceLayout, unique_timestamped_path};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading or mutating the job registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A job directory with the same fingerprint already exists. This is also
    /// returned when two different command lines hash to the same id.
    #[error("Job {0} already exists")]
    Conflict(JobId),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Job command is empty")]
    EmptyCommand,

    #[error("Registry I/O error: {0}")]
    Io(String),

    #[error("Registry file {path:?} is malformed: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Registry serialization error: {0}")]
    Serialization(String),
}

impl From<io::Error> for RegistryError {
    fn from(err: io::Error) -> Self {
        RegistryError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    #[default]
    Created,
    Seeded,
    Running,
    Stopped,
    Triaged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub target: String,
    pub params: String,
    #[serde(default)]
    pub state: JobState,
}

impl JobRecord {
    /// Splits an operator command line at its first space. `params` keeps the
    /// rest verbatim, so it matches the text the job id was hashed from.
    pub fn from_command(command: &str) -> Result<Self, RegistryError> {
        let (target, params) = command.split_once(' ').unwrap_or((command, ""));
        if target.is_empty() {
            return Err(RegistryError::EmptyCommand);
        }
        Ok(Self {
            target: target.to_string(),
            params: params.to_string(),
            state: JobState::Created,
        })
    }

    pub fn params_words(&self) -> impl Iterator<Item = &str> {
        self.params.split_whitespace()
    }

    /// Parameter words with the operator's input marker swapped for `replacement`.
    pub fn params_with_input(&self, marker: &str, replacement: &str) -> Vec<String> {
        self.params_words()
            .map(|w| w.replace(marker, replacement))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub record: JobRecord,
}

/// Result of seeding a job with initial samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Copied(usize),
    /// The source was neither a file nor a directory. Nothing was copied.
    Invalid,
}

/// Persisted mapping of job id to job metadata, in registration order.
///
/// The registry file is the source of truth for which jobs exist. Job directories
/// live next to it under `jobs/`.
#[derive(Debug)]
pub struct JobRegistry {
    layout: WorkspaceLayout,
    algorithm: FingerprintAlgorithm,
    jobs: IndexMap<JobId, JobRecord>,
}

impl JobRegistry {
    /// Loads the registry of `layout`. A missing or empty file is an empty registry.
    pub fn open(
        layout: &WorkspaceLayout,
        algorithm: FingerprintAlgorithm,
    ) -> Result<Self, RegistryError> {
        let path = layout.registry_file();
        let jobs = if path.is_file() {
            let content = fs::read_to_string(&path)?;
            toml::from_str::<IndexMap<JobId, JobRecord>>(&content).map_err(|e| {
                RegistryError::Malformed {
                    path: path.clone(),
                    message: e.to_string(),
                }
            })?
        } else {
            IndexMap::new()
        };
        Ok(Self {
            layout: layout.clone(),
            algorithm,
            jobs,
        })
    }

    fn save(&self) -> Result<(), RegistryError> {
        let text = toml::to_string(&self.jobs)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;
        fs::write(self.layout.registry_file(), text)?;
        Ok(())
    }

    pub fn fingerprint(&self, command: &str) -> JobId {
        JobId(self.algorithm.fingerprint(command))
    }

    pub fn get(&self, id: &JobId) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn job(&self, id: &JobId) -> Result<Job, RegistryError> {
        self.jobs
            .get(id)
            .map(|record| Job {
                id: id.clone(),
                record: record.clone(),
            })
            .ok_or_else(|| RegistryError::JobNotFound(id.clone()))
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobId, &JobRecord)> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Registers the job for `command`, creating its `afl-in/` and `afl-out/`.
    pub fn create(&mut self, command: &str) -> Result<JobId, RegistryError> {
        let record = JobRecord::from_command(command)?;
        let id = self.fingerprint(command);
        let job_dir = self.layout.job_dir(&id);
        if job_dir.exists() {
            return Err(RegistryError::Conflict(id));
        }
        fs::create_dir(&job_dir)?;
        fs::create_dir(self.layout.afl_in(&id))?;
        fs::create_dir(self.layout.afl_out(&id))?;

        log::info!("adding job {} for [{}]", id, record.target);
        self.jobs.insert(id.clone(), record);
        self.save()?;
        Ok(id)
    }

    /// Archives the job directory and forgets the job.
    ///
    /// The move and the registry edit are two separate steps. A crash between them
    /// leaves an archived directory with its record still present; running remove
    /// again drops the stale record.
    pub fn remove(&mut self, id: &JobId) -> Result<Option<PathBuf>, RegistryError> {
        let job_dir = self.layout.job_dir(id);
        let archived = if job_dir.exists() {
            let dest = unique_timestamped_path(&self.layout.archive_dir(), |ts| {
                format!("{ts}-{id}")
            });
            fs::rename(&job_dir, &dest)?;
            log::info!("archived job {} to {}", id, dest.display());
            Some(dest)
        } else if self.jobs.contains_key(id) {
            log::warn!("job {id} has no directory, dropping stale registry entry");
            None
        } else {
            return Err(RegistryError::JobNotFound(id.clone()));
        };

        if self.jobs.shift_remove(id).is_some() {
            self.save()?;
        }
        Ok(archived)
    }

    /// Copies a sample file, or every file below a sample directory, into `afl-in/`.
    pub fn seed(&mut self, id: &JobId, source: &Path) -> Result<SeedOutcome, RegistryError> {
        let afl_in = self.layout.afl_in(id);
        if !afl_in.is_dir() {
            return Err(RegistryError::JobNotFound(id.clone()));
        }

        let copied = if source.is_dir() {
            copy_files_recursively(source, &afl_in)?
        } else if source.is_file() {
            copy_into(source, &afl_in)?;
            1
        } else {
            log::warn!(
                "seed source {} is neither a file nor a directory, no seeds copied",
                source.display()
            );
            return Ok(SeedOutcome::Invalid);
        };

        log::info!("added {copied} initial samples for job {id}");
        self.advance(id, JobState::Created, JobState::Seeded)?;
        Ok(SeedOutcome::Copied(copied))
    }

    pub fn set_state(&mut self, id: &JobId, state: JobState) -> Result<(), RegistryError> {
        let record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::JobNotFound(id.clone()))?;
        if record.state != state {
            record.state = state;
            self.save()?;
        }
        Ok(())
    }

    /// Moves every job in state `from` to `to`.
    pub fn transition_all(&mut self, from: JobState, to: JobState) -> Result<(), RegistryError> {
        let mut changed = false;
        for record in self.jobs.values_mut().filter(|r| r.state == from) {
            record.state = to;
            changed = true;
        }
        if changed {
            self.save()?;
        }
        Ok(())
    }

    fn advance(&mut self, id: &JobId, from: JobState, to: JobState) -> Result<(), RegistryError> {
        match self.jobs.get(id) {
            Some(record) if record.state == from => self.set_state(id, to),
            _ => Ok(()),
        }
    }
}

fn copy_into(file: &Path, dir: &Path) -> Result<(), io::Error> {
    if let Some(name) = file.file_name() {
        fs::copy(file, dir.join(name))?;
    }
    Ok(())
}

fn copy_files_recursively(src: &Path, dest: &Path) -> Result<usize, io::Error> {
    let mut copied = 0;
    let mut entries: Vec<_> = fs::read_dir(src)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            copied += copy_files_recursively(&path, dest)?;
        } else if path.is_file() {
            copy_into(&path, dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}
