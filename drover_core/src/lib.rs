pub mod archive;
pub mod builder;
pub mod campaign;
pub mod compactor;
pub mod config;
pub mod decision;
pub mod fingerprint;
pub mod process;
pub mod registry;
pub mod status;
pub mod supervisor;
pub mod triage;
pub mod variant;
pub mod worker_config;
pub mod workspace;

pub use archive::{ArchiveError, ImportExport, ImportReport};
pub use builder::{BinaryBuilder, BuildError, CommandBuilder};
pub use campaign::{
    AddJobReport, AddJobRequest, Campaign, CampaignError, DestroyOutcome, JobSource, ShowKind,
    ShowReport,
};
pub use compactor::{CollisionPolicy, CompactionError, CompactionReport, SyncDirectoryCompactor};
pub use config::DroverConfig;
pub use decision::{DecisionProvider, InteractivePrompt, ScriptedDecisions};
pub use fingerprint::FingerprintAlgorithm;
pub use process::{ProcessError, ProcessOutput, ProcessRunner, ProcessSpec, SystemRunner};
pub use registry::{Job, JobId, JobRecord, JobRegistry, JobState, RegistryError, SeedOutcome};
pub use status::{CoverageReport, JobStatus, JobSummary, StatusError};
pub use supervisor::{LaunchVerb, StartOptions, StartReport, SupervisorError};
pub use triage::{CrashTriagePipeline, TriageError, TriageOutcome};
pub use variant::{BinarySet, Variant};
pub use worker_config::{WorkerConfigError, WorkerConfigWriter};
pub use workspace::{WorkspaceError, WorkspaceLayout};
