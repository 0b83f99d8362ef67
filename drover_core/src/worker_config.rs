use crate::config::{JobSettings, TargetWidth, WorkerSettings};
use crate::registry::Job;
use crate::variant::{BinarySet, Variant};
use crate::workspace::WorkspaceLayout;
use ini::{EscapePolicy, Ini, WriteOption};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Input-file marker understood by the fuzzer launcher.
pub const LAUNCHER_INPUT_MARKER: &str = "@@";

#[derive(Error, Debug)]
pub enum WorkerConfigError {
    #[error("Worker config I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for WorkerConfigError {
    fn from(err: io::Error) -> Self {
        WorkerConfigError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub afl: AflSection,
    pub target: TargetSection,
    pub job: JobSection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AflSection {
    pub dirs: DirsSection,
    pub ctrl: CtrlSection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirsSection {
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlSection {
    pub file: PathBuf,
    pub timeout: String,
    pub mem_limit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSection {
    pub target: PathBuf,
    pub cmdline: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSection {
    pub session: String,
    pub slave_only: Option<String>,
}

impl WorkerConfig {
    /// Launcher INI layout. Values are written verbatim since the launcher
    /// neither strips quotes nor unescapes.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        ini.with_section(Some("afl.dirs"))
            .set("input", self.afl.dirs.input.to_string_lossy())
            .set("output", self.afl.dirs.output.to_string_lossy());
        ini.with_section(Some("target"))
            .set("target", self.target.target.to_string_lossy())
            .set("cmdline", self.target.cmdline.as_str());
        ini.with_section(Some("afl.ctrl"))
            .set("file", self.afl.ctrl.file.to_string_lossy())
            .set("timeout", self.afl.ctrl.timeout.as_str())
            .set("mem_limit", self.afl.ctrl.mem_limit.as_str());
        ini.with_section(Some("job"))
            .set("session", self.job.session.as_str());
        if let Some(slave_only) = &self.job.slave_only {
            ini.with_section(Some("job"))
                .set("slave_only", slave_only.as_str());
        }
        ini
    }
}

fn write_options() -> WriteOption {
    WriteOption {
        escape_policy: EscapePolicy::Nothing,
        kv_separator: " = ",
        ..WriteOption::default()
    }
}

/// Writes the per-variant config files read by the fuzzer launcher.
pub struct WorkerConfigWriter<'a> {
    layout: &'a WorkspaceLayout,
    worker: &'a WorkerSettings,
    jobs: &'a JobSettings,
}

impl<'a> WorkerConfigWriter<'a> {
    pub fn new(
        layout: &'a WorkspaceLayout,
        worker: &'a WorkerSettings,
        jobs: &'a JobSettings,
    ) -> Self {
        Self {
            layout,
            worker,
            jobs,
        }
    }

    /// Fuzzing variants whose binaries are installed in the workspace.
    pub fn installed_variants(&self) -> Vec<Variant> {
        Variant::FUZZING
            .into_iter()
            .filter(|v| BinarySet::Fuzz(*v).is_installed(self.layout))
            .collect()
    }

    pub fn build(&self, job: &Job, variant: Variant) -> WorkerConfig {
        let id = &job.id;
        let afl_out = self.layout.afl_out(id);
        let harden_present = BinarySet::Fuzz(Variant::Harden).is_installed(self.layout);

        let mem_limit = match (variant, self.worker.effective_width()) {
            (Variant::Asan, TargetWidth::Bits64) => self.worker.mem_limit_asan_64.clone(),
            _ => self.worker.mem_limit_32.clone(),
        };

        WorkerConfig {
            afl: AflSection {
                dirs: DirsSection {
                    input: self.layout.afl_in(id),
                    output: afl_out.clone(),
                },
                ctrl: CtrlSection {
                    file: afl_out.join(format!(".cur_input_{}", variant.name())),
                    timeout: self.worker.timeout.clone(),
                    mem_limit,
                },
            },
            target: TargetSection {
                target: BinarySet::Fuzz(variant).binary_path(self.layout, &job.record.target),
                cmdline: job
                    .record
                    .params
                    .replace(&self.jobs.input_marker, LAUNCHER_INPUT_MARKER),
            },
            job: JobSection {
                session: "SESSION".to_string(),
                slave_only: (variant == Variant::Asan && harden_present).then(|| "on".to_string()),
            },
        }
    }

    /// Regenerates every config file for `job`. Returns the paths written.
    pub fn write_all(&self, job: &Job) -> Result<Vec<PathBuf>, WorkerConfigError> {
        let mut written = Vec::new();
        for variant in self.installed_variants() {
            let path = self.layout.worker_config(&job.id, variant);
            self.build(job, variant)
                .to_ini()
                .write_to_file_opt(&path, write_options())?;
            log::debug!("wrote {} worker config {}", variant, path.display());
            written.push(path);
        }
        Ok(written)
    }
}
