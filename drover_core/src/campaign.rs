use crate::archive::{ArchiveError, ImportExport, ImportReport};
use crate::builder::{BinaryBuilder, BuildError};
use crate::compactor::SyncDirectoryCompactor;
use crate::config::DroverConfig;
use crate::decision::DecisionProvider;
use crate::process::ProcessRunner;
use crate::registry::{JobId, JobRegistry, RegistryError, SeedOutcome};
use crate::status::{
    CoverageReport, JobStatus, JobSummary, StatusError, StatusReporter, coverage_reports,
    list_jobs,
};
use crate::supervisor::{FuzzerSupervisor, StartOptions, StartReport, SupervisorError};
use crate::triage::{CrashTriagePipeline, TriageError, TriageOutcome};
use crate::variant::{BinarySet, Variant};
use crate::worker_config::{WorkerConfigError, WorkerConfigWriter};
use crate::workspace::{WorkspaceError, WorkspaceLayout};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    WorkerConfig(#[from] WorkerConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Triage(#[from] TriageError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

/// Which job `add_job` works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource {
    /// Register a new job for this command line.
    Command(String),
    /// Add samples or sessions to a job that already exists.
    Existing(JobId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddJobRequest {
    pub source: JobSource,
    pub sample: Option<PathBuf>,
    pub import: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddJobReport {
    pub id: JobId,
    pub seeded: Option<SeedOutcome>,
    pub imported: Option<ImportReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowKind {
    Jobs,
    Status,
    Coverage,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ShowReport {
    Jobs(Vec<JobSummary>),
    Status(Vec<JobStatus>),
    Coverage(Vec<CoverageReport>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    /// There was no workspace to begin with.
    AlreadyGone,
    Declined,
}

/// One workspace and the collaborators every lifecycle command needs.
pub struct Campaign {
    layout: WorkspaceLayout,
    config: DroverConfig,
    runner: Box<dyn ProcessRunner>,
    decisions: Box<dyn DecisionProvider>,
}

impl Campaign {
    pub fn new(
        config: DroverConfig,
        runner: Box<dyn ProcessRunner>,
        decisions: Box<dyn DecisionProvider>,
    ) -> Self {
        Self {
            layout: WorkspaceLayout::new(config.workspace.directory.clone()),
            config,
            runner,
            decisions,
        }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    fn open_registry(&self) -> Result<JobRegistry, CampaignError> {
        self.layout.ensure_exists()?;
        Ok(JobRegistry::open(&self.layout, self.config.jobs.fingerprint)?)
    }

    fn compactor(&self) -> SyncDirectoryCompactor {
        SyncDirectoryCompactor::new(self.config.compaction.collision_policy)
    }

    /// Creates the workspace tree and installs the binary sets of `variants`.
    ///
    /// A build failure aborts the command but keeps what was already created.
    pub fn create_workspace(
        &mut self,
        variants: &[Variant],
        builder: &mut dyn BinaryBuilder,
    ) -> Result<(), CampaignError> {
        self.layout.create()?;
        for variant in variants {
            for set in BinarySet::for_variant(*variant) {
                builder.build(&self.layout, set)?;
                log::info!("installed {} binaries", set.dir_name());
            }
        }
        Ok(())
    }

    pub fn add_job(&mut self, request: &AddJobRequest) -> Result<AddJobReport, CampaignError> {
        let mut registry = self.open_registry()?;
        let archives = ImportExport::new(&self.layout, self.compactor());
        let mut seeded = None;
        let mut imported = None;

        let id = match &request.source {
            JobSource::Command(command) => {
                let id = registry.create(command)?;
                let job = registry.job(&id)?;
                WorkerConfigWriter::new(&self.layout, &self.config.worker, &self.config.jobs)
                    .write_all(&job)?;
                if let Some(archive) = &request.import {
                    imported = Some(archives.import(&id, archive)?);
                }
                if let Some(sample) = &request.sample {
                    seeded = Some(registry.seed(&id, sample)?);
                }
                id
            }
            JobSource::Existing(id) => {
                registry.job(id)?;
                if let Some(sample) = &request.sample {
                    seeded = Some(registry.seed(id, sample)?);
                }
                if let Some(archive) = &request.import {
                    imported = Some(archives.import(id, archive)?);
                }
                id.clone()
            }
        };
        Ok(AddJobReport {
            id,
            seeded,
            imported,
        })
    }

    /// Archives the job directory. Returns where it went, if it still existed.
    pub fn remove_job(&mut self, id: &JobId) -> Result<Option<PathBuf>, CampaignError> {
        let mut registry = self.open_registry()?;
        Ok(registry.remove(id)?)
    }

    pub fn start(
        &mut self,
        id: &JobId,
        options: StartOptions,
    ) -> Result<StartReport, CampaignError> {
        let mut registry = self.open_registry()?;
        let report = FuzzerSupervisor::new(&self.layout, &self.config, self.runner.as_mut())
            .start(&mut registry, id, options)?;
        Ok(report)
    }

    pub fn stop(&mut self) -> Result<(), CampaignError> {
        let mut registry = self.open_registry()?;
        FuzzerSupervisor::new(&self.layout, &self.config, self.runner.as_mut())
            .stop(&mut registry)?;
        Ok(())
    }

    pub fn show(&mut self, kind: ShowKind) -> Result<ShowReport, CampaignError> {
        let registry = self.open_registry()?;
        let report = match kind {
            ShowKind::Jobs => ShowReport::Jobs(list_jobs(&registry)),
            ShowKind::Coverage => ShowReport::Coverage(coverage_reports(&self.layout, &registry)),
            ShowKind::Status => ShowReport::Status(
                StatusReporter::new(&self.layout, &self.config, self.runner.as_mut())
                    .status(&registry)?,
            ),
        };
        Ok(report)
    }

    pub fn triage(&mut self, id: Option<&JobId>) -> Result<Vec<TriageOutcome>, CampaignError> {
        let mut registry = self.open_registry()?;
        let outcomes = CrashTriagePipeline::new(
            &self.layout,
            &self.config,
            self.runner.as_mut(),
            self.decisions.as_mut(),
        )
        .triage(&mut registry, id)?;
        Ok(outcomes)
    }

    /// Removes the whole workspace once the operator confirms.
    pub fn destroy(&mut self) -> Result<DestroyOutcome, CampaignError> {
        if !self.layout.exists() {
            return Ok(DestroyOutcome::AlreadyGone);
        }
        let question = format!(
            "Destroy workspace {} and everything in it?",
            self.layout.root().display()
        );
        if !self.decisions.confirm(&question) {
            return Ok(DestroyOutcome::Declined);
        }
        if self.layout.destroy()? {
            log::info!("destroyed workspace {}", self.layout.root().display());
            Ok(DestroyOutcome::Destroyed)
        } else {
            Ok(DestroyOutcome::AlreadyGone)
        }
    }

    pub fn export(&mut self, id: &JobId, dest: &Path) -> Result<PathBuf, CampaignError> {
        let registry = self.open_registry()?;
        registry.job(id)?;
        Ok(ImportExport::new(&self.layout, self.compactor()).export(id, dest)?)
    }
}
