use crate::compactor::CollisionPolicy;
use crate::fingerprint::FingerprintAlgorithm;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WorkspaceSettings {
    #[serde(default = "default_workspace_dir")]
    pub directory: PathBuf,
}

pub fn default_workspace_dir() -> PathBuf {
    PathBuf::from("./.drover")
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            directory: default_workspace_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct JobSettings {
    #[serde(default)]
    pub fingerprint: FingerprintAlgorithm,
    /// Marker the operator uses for the input file in job params.
    #[serde(default = "default_input_marker")]
    pub input_marker: String,
}

fn default_input_marker() -> String {
    "@@".to_string()
}

/// Target pointer width used to pick the worker memory limit.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TargetWidth {
    Bits32,
    Bits64,
}

impl TargetWidth {
    pub fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            TargetWidth::Bits64
        } else {
            TargetWidth::Bits32
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_timeout")]
    pub timeout: String,
    #[serde(default = "default_mem_limit_asan_64")]
    pub mem_limit_asan_64: String,
    #[serde(default = "default_mem_limit_32")]
    pub mem_limit_32: String,
    #[serde(default)]
    pub target_width: Option<TargetWidth>,
}

fn default_worker_timeout() -> String {
    "3000+".to_string()
}
fn default_mem_limit_asan_64() -> String {
    "30000000".to_string()
}
fn default_mem_limit_32() -> String {
    "800".to_string()
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            timeout: default_worker_timeout(),
            mem_limit_asan_64: default_mem_limit_asan_64(),
            mem_limit_32: default_mem_limit_32(),
            target_width: None,
        }
    }
}

impl WorkerSettings {
    pub fn effective_width(&self) -> TargetWidth {
        self.target_width.unwrap_or_else(TargetWidth::host)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default = "default_fuzzer_process")]
    pub fuzzer_process: String,
    #[serde(default = "default_core_pattern_path")]
    pub core_pattern_path: PathBuf,
    /// Overrides the detected number of available cores.
    #[serde(default)]
    pub cores: Option<usize>,
    #[serde(default = "default_minimizer")]
    pub minimizer: String,
    #[serde(default = "default_cmin_mem_limit")]
    pub cmin_mem_limit: String,
    #[serde(default = "default_cmin_timeout_ms")]
    pub cmin_timeout_ms: u64,
    #[serde(default = "default_coverage_tool")]
    pub coverage_tool: String,
    #[serde(default = "default_lcov_path")]
    pub lcov_path: PathBuf,
}

fn default_launcher() -> String {
    "afl-multicore".to_string()
}
fn default_fuzzer_process() -> String {
    "afl-fuzz".to_string()
}
fn default_core_pattern_path() -> PathBuf {
    PathBuf::from("/proc/sys/kernel/core_pattern")
}
fn default_minimizer() -> String {
    "afl-minimize".to_string()
}
fn default_cmin_mem_limit() -> String {
    "500".to_string()
}
fn default_cmin_timeout_ms() -> u64 {
    5000
}
fn default_coverage_tool() -> String {
    "afl-cov".to_string()
}
fn default_lcov_path() -> PathBuf {
    PathBuf::from("/usr/bin/lcov")
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            launcher: default_launcher(),
            fuzzer_process: default_fuzzer_process(),
            core_pattern_path: default_core_pattern_path(),
            cores: None,
            minimizer: default_minimizer(),
            cmin_mem_limit: default_cmin_mem_limit(),
            cmin_timeout_ms: default_cmin_timeout_ms(),
            coverage_tool: default_coverage_tool(),
            lcov_path: default_lcov_path(),
        }
    }
}

impl SupervisorSettings {
    pub fn available_cores(&self) -> usize {
        self.cores
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CompactionSettings {
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TriageSettings {
    #[serde(default = "default_collector")]
    pub collector: String,
    #[serde(default = "default_sanitizer_options")]
    pub sanitizer_options: String,
    #[serde(default = "default_status_tool")]
    pub status_tool: String,
}

fn default_collector() -> String {
    "afl-collect".to_string()
}
fn default_sanitizer_options() -> String {
    "abort_on_error=1:disable_coredump=1:symbolize=1".to_string()
}
fn default_status_tool() -> String {
    "afl-whatsup".to_string()
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            collector: default_collector(),
            sanitizer_options: default_sanitizer_options(),
            status_tool: default_status_tool(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuildSettings {
    /// Command run once per binary set; receives `DROVER_BINARY_SET` and `DROVER_PREFIX`.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DroverConfig {
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub compaction: CompactionSettings,
    #[serde(default)]
    pub triage: TriageSettings,
    #[serde(default)]
    pub build: BuildSettings,
}

impl DroverConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: DroverConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
