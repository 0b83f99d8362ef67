use crate::compactor::{CompactionError, SyncDirectoryCompactor};
use crate::config::DroverConfig;
use crate::process::{ProcessError, ProcessRunner, ProcessSpec};
use crate::registry::{JobId, JobRegistry, JobState};
use crate::workspace::{WorkspaceLayout, count_visible_entries};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// End of the banner printed by the status tool before the summary.
const BANNER_END: &str = "==\n\n";

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Status tool failed for job {id}: {status}")]
    ToolFailed { id: JobId, status: String },

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: JobId,
    pub target: String,
    pub params: String,
    pub state: JobState,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: JobId,
    pub target: String,
    pub state: JobState,
    /// Fuzzer summary lines, banner removed.
    pub summary: String,
    pub unique_crashes: usize,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CoverageReport {
    pub id: JobId,
    pub path: PathBuf,
}

pub fn list_jobs(registry: &JobRegistry) -> Vec<JobSummary> {
    registry
        .iter()
        .map(|(id, record)| JobSummary {
            id: id.clone(),
            target: record.target.clone(),
            params: record.params.clone(),
            state: record.state,
        })
        .collect()
}

/// Coverage web reports that the tracker has produced so far.
pub fn coverage_reports(layout: &WorkspaceLayout, registry: &JobRegistry) -> Vec<CoverageReport> {
    registry
        .iter()
        .map(|(id, _)| CoverageReport {
            id: id.clone(),
            path: layout.afl_out(id).join("cov/web/lcov-web-final"),
        })
        .filter(|report| report.path.exists())
        .collect()
}

fn strip_banner(output: &str) -> &str {
    match output.find(BANNER_END) {
        Some(pos) => &output[pos + BANNER_END.len()..],
        None => output,
    }
}

pub struct StatusReporter<'a> {
    layout: &'a WorkspaceLayout,
    config: &'a DroverConfig,
    runner: &'a mut dyn ProcessRunner,
}

impl<'a> StatusReporter<'a> {
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

    /// Compacts every job and asks the status tool for a summary of it.
    pub fn status(&mut self, registry: &JobRegistry) -> Result<Vec<JobStatus>, StatusError> {
        let compactor = SyncDirectoryCompactor::new(self.config.compaction.collision_policy);
        let mut statuses = Vec::with_capacity(registry.len());

        for (id, record) in registry.iter() {
            let afl_out = self.layout.afl_out(id);
            compactor.compact(&afl_out)?;

            let spec = ProcessSpec::new(self.config.triage.status_tool.as_str())
                .arg("-s")
                .arg(afl_out.to_string_lossy());
            let output = self.runner.run(&spec)?;
            if !output.success() {
                return Err(StatusError::ToolFailed {
                    id: id.clone(),
                    status: output.describe(),
                });
            }
            let text = String::from_utf8_lossy(&output.stdout);

            statuses.push(JobStatus {
                id: id.clone(),
                target: record.target.clone(),
                state: record.state,
                summary: strip_banner(&text).trim_end().to_string(),
                unique_crashes: count_visible_entries(&self.layout.unique_dir(id)),
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintAlgorithm;
    use crate::process::ProcessOutput;
    use crate::process::test_utils::FakeRunner;
    use std::fs;
    use tempfile::tempdir;

    const WHATSUP: &str = "status check tool for afl-fuzz by <lcamtuf@google.com>\n\n\
        Summary stats\n=============\n\n       Fuzzers alive : 2\n      Total run time : 1 hours\n";

    #[yare::parameterized(
        with_banner = { WHATSUP, "       Fuzzers alive : 2\n      Total run time : 1 hours\n" },
        without_banner = { "plain\n", "plain\n" },
    )]
    fn banner_is_stripped(raw: &str, expected: &str) {
        assert_eq!(strip_banner(raw), expected);
    }

    #[test]
    fn status_compacts_and_counts_unique() {
        let dir = tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path().join("ws"));
        layout.create().unwrap();
        let mut registry = JobRegistry::open(&layout, FingerprintAlgorithm::Crc32).unwrap();
        let id = registry.create("prog @@").unwrap();

        let sync = layout.afl_out(&id);
        fs::create_dir_all(sync.join("SESSION003/queue")).unwrap();
        fs::write(sync.join("SESSION003/queue/id:000000"), b"a").unwrap();
        fs::create_dir_all(layout.unique_dir(&id).join(".scripts")).unwrap();
        fs::write(layout.unique_dir(&id).join("id:000001"), b"c").unwrap();

        let config = DroverConfig::default();
        let mut runner = FakeRunner::new(|_| ProcessOutput::exited(0).with_stdout(WHATSUP));
        let statuses = StatusReporter::new(&layout, &config, &mut runner)
            .status(&registry)
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].unique_crashes, 1);
        assert!(statuses[0].summary.starts_with("       Fuzzers alive : 2"));
        assert_eq!(runner.calls[0].program, "afl-whatsup");
        assert_eq!(runner.calls[0].args[0], "-s");
        assert!(sync.join("SESSION000/queue/id:000000").is_file());
    }

    #[test]
    fn status_tool_failure_is_reported() {
        let dir = tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path().join("ws"));
        layout.create().unwrap();
        let mut registry = JobRegistry::open(&layout, FingerprintAlgorithm::Crc32).unwrap();
        registry.create("prog @@").unwrap();

        let config = DroverConfig::default();
        let mut runner = FakeRunner::new(|_| ProcessOutput::exited(1));
        assert!(matches!(
            StatusReporter::new(&layout, &config, &mut runner).status(&registry),
            Err(StatusError::ToolFailed { .. })
        ));
    }

    #[test]
    fn lists_jobs_and_existing_coverage_reports() {
        let dir = tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path().join("ws"));
        layout.create().unwrap();
        let mut registry = JobRegistry::open(&layout, FingerprintAlgorithm::Crc32).unwrap();
        let first = registry.create("prog -a @@").unwrap();
        let second = registry.create("prog -b @@").unwrap();
        fs::create_dir_all(layout.afl_out(&second).join("cov/web/lcov-web-final")).unwrap();

        let jobs = list_jobs(&registry);
        assert_eq!(
            jobs.iter().map(|j| j.id.clone()).collect::<Vec<_>>(),
            vec![first, second.clone()]
        );
        assert_eq!(jobs[0].params, "-a @@");

        let reports = coverage_reports(&layout, &registry);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, second);
    }
}
