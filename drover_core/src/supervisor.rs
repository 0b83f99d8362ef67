use crate::compactor::{CompactionError, SyncDirectoryCompactor};
use crate::config::DroverConfig;
use crate::process::{ProcessError, ProcessRunner, ProcessSpec, ProcessStatus};
use crate::registry::{Job, JobId, JobRegistry, JobState, RegistryError};
use crate::variant::{BinarySet, Variant};
use crate::worker_config::{LAUNCHER_INPUT_MARKER, WorkerConfigError, WorkerConfigWriter};
use crate::workspace::{WorkspaceLayout, is_empty_dir, unique_timestamped_path};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

const CORE_PATTERN_FIX: &str = "echo core | sudo tee /proc/sys/kernel/core_pattern";
const WORKER_LOG_MARKERS: [&str; 4] = ["Starting master", "Starting slave", " Master ", " Slave "];

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Core dumps are piped to a handler or disabled ({pattern:?}); run: {fix}")]
    CorePattern { pattern: String, fix: &'static str },

    #[error("Could not read core pattern {path:?}: {message}")]
    CorePatternUnreadable { path: PathBuf, message: String },

    #[error("No fuzzing binaries installed")]
    NoFuzzBinaries,

    #[error("No coverage binaries installed")]
    NoCoverageBinaries,

    #[error("Launching {variant} workers failed ({status}), see {log:?}")]
    LaunchFailed {
        variant: Variant,
        status: String,
        log: PathBuf,
    },

    #[error("Killing fuzzer processes failed: {0}")]
    KillFailed(String),

    #[error("Corpus minimization failed: {0}")]
    MinimizeFailed(String),

    #[error("Supervisor I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    WorkerConfig(#[from] WorkerConfigError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl From<io::Error> for SupervisorError {
    fn from(err: io::Error) -> Self {
        SupervisorError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartOptions {
    pub minimize: bool,
    pub coverage: bool,
}

/// Launcher verb, derived from whether the sync directory already holds output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchVerb {
    Start,
    Resume,
    Add,
}

impl LaunchVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchVerb::Start => "start",
            LaunchVerb::Resume => "resume",
            LaunchVerb::Add => "add",
        }
    }
}

impl fmt::Display for LaunchVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Primary,
    Secondary,
}

/// A group of workers of one variant started by a single launcher call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGroup {
    pub variant: Variant,
    pub role: WorkerRole,
    pub cores: usize,
}

impl LaunchGroup {
    pub fn verb(&self, primary_verb: LaunchVerb) -> LaunchVerb {
        match self.role {
            WorkerRole::Primary => primary_verb,
            WorkerRole::Secondary => LaunchVerb::Add,
        }
    }
}

/// Splits `cores` between the installed fuzzing variants.
pub fn plan_topology(
    installed: &[Variant],
    cores: usize,
) -> Result<Vec<LaunchGroup>, SupervisorError> {
    let harden = installed.contains(&Variant::Harden);
    let asan = installed.contains(&Variant::Asan);
    let cores = cores.max(1);

    let group = |variant, role, cores| LaunchGroup {
        variant,
        role,
        cores,
    };
    match (harden, asan) {
        (true, true) => {
            let half = (cores / 2).max(1);
            Ok(vec![
                group(Variant::Harden, WorkerRole::Primary, half),
                group(
                    Variant::Asan,
                    WorkerRole::Secondary,
                    cores.saturating_sub(half).max(1),
                ),
            ])
        }
        (true, false) => Ok(vec![group(Variant::Harden, WorkerRole::Primary, cores)]),
        (false, true) => Ok(vec![group(Variant::Asan, WorkerRole::Primary, cores)]),
        (false, false) => Err(SupervisorError::NoFuzzBinaries),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub verb: LaunchVerb,
    pub groups: Vec<LaunchGroup>,
    /// Worker start lines found in the launcher logs.
    pub workers: Vec<String>,
    pub coverage_pid: Option<u32>,
    pub minimized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimizeReport {
    pub archived_sync_dir: PathBuf,
    pub corpus_size: usize,
}

/// Starts, resumes and stops the external fuzzer workers of a job.
pub struct FuzzerSupervisor<'a> {
    layout: &'a WorkspaceLayout,
    config: &'a DroverConfig,
    runner: &'a mut dyn ProcessRunner,
}

impl<'a> FuzzerSupervisor<'a> {
    pub fn new(
        layout: &'a WorkspaceLayout,
        config: &'a DroverConfig,
        runner: &'a mut dyn ProcessRunner,
    ) -> Self {
        Self {
            layout,
            config,
            runner,
        }
    }

    fn worker_configs(&self) -> WorkerConfigWriter<'_> {
        WorkerConfigWriter::new(self.layout, &self.config.worker, &self.config.jobs)
    }

    pub fn start(
        &mut self,
        registry: &mut JobRegistry,
        id: &JobId,
        options: StartOptions,
    ) -> Result<StartReport, SupervisorError> {
        let job = registry.job(id)?;
        let afl_out = self.layout.afl_out(id);
        fs::create_dir_all(&afl_out)?;

        let mut minimized = false;
        if !is_empty_dir(&afl_out)? {
            SyncDirectoryCompactor::new(self.config.compaction.collision_policy)
                .compact(&afl_out)?;
            if options.minimize {
                self.minimize(&job)?;
                minimized = true;
            }
        }

        let coverage_pid = if options.coverage {
            Some(self.start_coverage(&job)?)
        } else {
            None
        };

        self.check_core_pattern()?;

        let writer = self.worker_configs();
        writer.write_all(&job)?;
        let installed = writer.installed_variants();

        let verb = if is_empty_dir(&afl_out)? {
            LaunchVerb::Start
        } else {
            LaunchVerb::Resume
        };
        let groups = plan_topology(&installed, self.config.supervisor.available_cores())?;

        let mut workers = Vec::new();
        for group in &groups {
            self.launch(&job, group, verb)?;
            workers.extend(self.scan_worker_log(group.variant));
        }
        for line in &workers {
            log::info!("{line}");
        }

        registry.set_state(id, JobState::Running)?;
        log::info!("{} job {} on {} group(s)", verb, id, groups.len());
        Ok(StartReport {
            verb,
            groups,
            workers,
            coverage_pid,
            minimized,
        })
    }

    fn launch(
        &mut self,
        job: &Job,
        group: &LaunchGroup,
        primary_verb: LaunchVerb,
    ) -> Result<(), SupervisorError> {
        let variant = group.variant;
        let log = self.layout.log_file(&format!("afl-{}.log", variant.name()));
        let conf = self.layout.worker_config(&job.id, variant);
        let spec = ProcessSpec::new(self.config.supervisor.launcher.as_str())
            .arg("-c")
            .arg(conf.to_string_lossy())
            .arg(group.verb(primary_verb).as_str())
            .arg(group.cores.to_string())
            .arg("-v")
            .env("AFL_SKIP_CPUFREQ", "1")
            .log_to(&log);

        log::info!(
            "launching {} {} worker(s) for job {}",
            group.cores,
            variant,
            job.id
        );
        let output = self.runner.run(&spec)?;
        if output.success() {
            return Ok(());
        }

        log::error!("launcher for {variant} failed, killing all fuzzer processes");
        if let Err(e) = self.kill_all() {
            log::error!("kill fallback failed: {e}");
        }
        Err(SupervisorError::LaunchFailed {
            variant,
            status: output.describe(),
            log,
        })
    }

    fn scan_worker_log(&self, variant: Variant) -> Vec<String> {
        let log = self.layout.log_file(&format!("afl-{}.log", variant.name()));
        fs::read_to_string(log)
            .map(|text| {
                text.lines()
                    .filter(|l| WORKER_LOG_MARKERS.iter().any(|m| l.contains(m)))
                    .map(|l| l.trim().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_core_pattern(&self) -> Result<(), SupervisorError> {
        let path = &self.config.supervisor.core_pattern_path;
        let pattern = fs::read_to_string(path).map_err(|e| {
            SupervisorError::CorePatternUnreadable {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern.starts_with('|') {
            return Err(SupervisorError::CorePattern {
                pattern: pattern.to_string(),
                fix: CORE_PATTERN_FIX,
            });
        }
        Ok(())
    }

    fn kill_all(&mut self) -> Result<(), SupervisorError> {
        let spec = ProcessSpec::new("pkill")
            .arg("-9")
            .arg(self.config.supervisor.fuzzer_process.as_str());
        let output = self.runner.run(&spec)?;
        match output.status {
            // 1 means no process matched.
            ProcessStatus::Exited(0) | ProcessStatus::Exited(1) => Ok(()),
            _ => Err(SupervisorError::KillFailed(output.describe())),
        }
    }

    /// Kills every fuzzer process and marks running jobs as stopped.
    pub fn stop(&mut self, registry: &mut JobRegistry) -> Result<(), SupervisorError> {
        log::info!("stopping all fuzzers");
        self.kill_all()?;
        registry.transition_all(JobState::Running, JobState::Stopped)?;
        Ok(())
    }

    /// Minimizes the job corpus and makes it the new seed set.
    pub fn minimize(&mut self, job: &Job) -> Result<MinimizeReport, SupervisorError> {
        let id = &job.id;
        let variant = [Variant::Harden, Variant::Asan]
            .into_iter()
            .find(|v| BinarySet::Fuzz(*v).is_installed(self.layout))
            .ok_or(SupervisorError::NoFuzzBinaries)?;
        let binary = BinarySet::Fuzz(variant).binary_path(self.layout, &job.record.target);

        let collect = self.layout.collect_dir(id);
        if collect.exists() {
            fs::remove_dir_all(&collect)?;
        }
        let afl_out = self.layout.afl_out(id);
        let supervisor = &self.config.supervisor;
        let spec = ProcessSpec::new(supervisor.minimizer.as_str())
            .arg("-c")
            .arg(collect.to_string_lossy())
            .arg("--cmin")
            .arg(format!("--cmin-mem-limit={}", supervisor.cmin_mem_limit))
            .arg(format!("--cmin-timeout={}", supervisor.cmin_timeout_ms))
            .arg(afl_out.to_string_lossy())
            .arg("--")
            .arg(binary.to_string_lossy())
            .args(
                job.record
                    .params_with_input(&self.config.jobs.input_marker, LAUNCHER_INPUT_MARKER),
            )
            .log_to(self.layout.log_file("afl-minimize.log"));

        log::info!("minimizing corpus of job {id}");
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(SupervisorError::MinimizeFailed(output.describe()));
        }

        let collected: Vec<PathBuf> = match fs::read_dir(&collect) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.path())
                .collect(),
            Err(_) => Vec::new(),
        };
        if collected.is_empty() {
            return Err(SupervisorError::MinimizeFailed(
                "no inputs were collected".to_string(),
            ));
        }

        let job_archive = self.layout.job_archive_dir(id);
        fs::create_dir_all(&job_archive)?;
        let archived = unique_timestamped_path(&job_archive, |ts| format!("afl-out.{ts}"));
        fs::rename(&afl_out, &archived)?;
        fs::create_dir(&afl_out)?;

        let afl_in = self.layout.afl_in(id);
        if afl_in.exists() {
            fs::remove_dir_all(&afl_in)?;
        }
        fs::create_dir(&afl_in)?;
        for file in &collected {
            if let Some(name) = file.file_name() {
                fs::rename(file, afl_in.join(name))?;
            }
        }
        fs::remove_dir_all(&collect)?;

        log::info!(
            "job {} reseeded with {} minimized inputs, old output in {}",
            id,
            collected.len(),
            archived.display()
        );
        Ok(MinimizeReport {
            archived_sync_dir: archived,
            corpus_size: collected.len(),
        })
    }

    /// Launches the live coverage tracker in the background and returns its pid.
    pub fn start_coverage(&mut self, job: &Job) -> Result<u32, SupervisorError> {
        let coverage = BinarySet::Fuzz(Variant::Coverage);
        if !coverage.is_installed(self.layout) {
            return Err(SupervisorError::NoCoverageBinaries);
        }
        let binary = coverage.binary_path(self.layout, &job.record.target);
        let mut coverage_cmd = vec![binary.to_string_lossy().into_owned()];
        coverage_cmd.extend(
            job.record
                .params_with_input(&self.config.jobs.input_marker, "AFL_FILE"),
        );

        let spec = ProcessSpec::new(self.config.supervisor.coverage_tool.as_str())
            .arg("-d")
            .arg(self.layout.afl_out(&job.id).to_string_lossy())
            .arg("--live")
            .arg("--lcov-path")
            .arg(self.config.supervisor.lcov_path.to_string_lossy())
            .arg("--coverage-cmd")
            .arg(coverage_cmd.join(" "))
            .arg("--code-dir")
            .arg(".")
            .arg("-v")
            .log_to(self.layout.log_file("afl-coverage.log"));

        let pid = self.runner.spawn_detached(&spec)?;
        log::info!("coverage tracking for job {} started (pid {pid})", job.id);
        Ok(pid)
    }
}
