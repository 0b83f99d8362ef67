use crate::compactor::{CompactionError, SyncDirectoryCompactor};
use crate::config::DroverConfig;
use crate::decision::DecisionProvider;
use crate::process::{ProcessError, ProcessRunner, ProcessSpec};
use crate::registry::{Job, JobId, JobRegistry, JobState, RegistryError};
use crate::variant::{BinarySet, Variant};
use crate::worker_config::LAUNCHER_INPUT_MARKER;
use crate::workspace::{WorkspaceLayout, count_visible_entries, unique_timestamped_path};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCRIPT_PREFIX: &str = "gdb_script";
const SCRIPTS_DIR: &str = ".scripts";

#[derive(Error, Debug)]
pub enum TriageError {
    #[error("Crash collection with {variant} binary failed ({status}), see {log:?}")]
    CollectFailed {
        variant: Variant,
        status: String,
        log: PathBuf,
    },

    #[error("Triage I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl From<io::Error> for TriageError {
    fn from(err: io::Error) -> Self {
        TriageError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriageOutcome {
    /// The operator declined to redo an existing triage.
    Skipped { id: JobId },
    Triaged {
        id: JobId,
        unique_crashes: usize,
        /// Where the previous `unique/` went, on a re-run.
        previous: Option<PathBuf>,
    },
}

/// Replays collected crashes against debug builds and keeps the verified unique ones.
pub struct CrashTriagePipeline<'a> {
    layout: &'a WorkspaceLayout,
    config: &'a DroverConfig,
    runner: &'a mut dyn ProcessRunner,
    decisions: &'a mut dyn DecisionProvider,
}

impl<'a> CrashTriagePipeline<'a> {
    pub fn new(
        layout: &'a WorkspaceLayout,
        config: &'a DroverConfig,
        runner: &'a mut dyn ProcessRunner,
        decisions: &'a mut dyn DecisionProvider,
    ) -> Self {
        Self {
            layout,
            config,
            runner,
            decisions,
        }
    }

    /// Triages one job, or every registered job in registry order.
    pub fn triage(
        &mut self,
        registry: &mut JobRegistry,
        id: Option<&JobId>,
    ) -> Result<Vec<TriageOutcome>, TriageError> {
        let ids = match id {
            Some(id) => vec![id.clone()],
            None => registry.ids(),
        };
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in &ids {
            let job = registry.job(id)?;
            let outcome = self.triage_job(&job)?;
            if matches!(outcome, TriageOutcome::Triaged { .. }) {
                registry.set_state(id, JobState::Triaged)?;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn triage_job(&mut self, job: &Job) -> Result<TriageOutcome, TriageError> {
        let id = &job.id;
        let afl_out = self.layout.afl_out(id);
        SyncDirectoryCompactor::new(self.config.compaction.collision_policy).compact(&afl_out)?;

        let unique = self.layout.unique_dir(id);
        let mut previous = None;
        if unique.exists() {
            if !self.decisions.confirm("Rerun triaging?") {
                log::info!("keeping existing triage results of job {id}");
                return Ok(TriageOutcome::Skipped { id: id.clone() });
            }
            let backup =
                unique_timestamped_path(&self.layout.job_dir(id), |ts| format!("unique.{ts}"));
            fs::rename(&unique, &backup)?;
            log::info!("previous unique crashes moved to {}", backup.display());
            previous = Some(backup);
        }
        fs::create_dir(&unique)?;

        let exploitable = self.layout.exploitable_dir(id);
        for variant in [Variant::Harden, Variant::Asan] {
            let binary = BinarySet::Debug(variant).binary_path(self.layout, &job.record.target);
            if !binary.exists() {
                continue;
            }
            let output = exploitable.join(variant.triage_prefix()).join("crashes");
            log::info!("collecting {variant} crashes of job {id}");
            self.collect(job, variant, &binary, &afl_out, &output, "")?;
            tidy_scripts(&output)?;
        }

        if exploitable.is_dir() {
            if let Some(variant) = self.replay_variant(&job.record.target) {
                let binary =
                    BinarySet::Debug(variant).binary_path(self.layout, &job.record.target);
                log::info!("deduplicating crashes of job {id} with {variant} binary");
                self.collect(job, variant, &binary, &exploitable, &unique, "_unique")?;
                tidy_scripts(&unique)?;
            }
        }

        let unique_crashes = count_visible_entries(&unique);
        log::info!("job {id}: {unique_crashes} unique crashes");
        Ok(TriageOutcome::Triaged {
            id: id.clone(),
            unique_crashes,
            previous,
        })
    }

    /// Debug build used for the final pass: asan, falling back to harden.
    fn replay_variant(&self, target: &str) -> Option<Variant> {
        [Variant::Asan, Variant::Harden]
            .into_iter()
            .find(|v| BinarySet::Debug(*v).binary_path(self.layout, target).exists())
    }

    fn collect(
        &mut self,
        job: &Job,
        variant: Variant,
        binary: &Path,
        input: &Path,
        output: &Path,
        log_suffix: &str,
    ) -> Result<(), TriageError> {
        let triage = &self.config.triage;
        let log = self
            .layout
            .log_file(&format!("afl-{}_dbg{log_suffix}.log", variant.name()));
        let spec = ProcessSpec::new("sh")
            .args(["-c", "ulimit -c 0; exec \"$@\"", "sh"])
            .arg(triage.collector.as_str())
            .args(["-r", "-j"])
            .arg(self.config.supervisor.available_cores().to_string())
            .args(["-e", SCRIPT_PREFIX])
            .arg(input.to_string_lossy())
            .arg(output.to_string_lossy())
            .arg("--")
            .arg(binary.to_string_lossy())
            .args(
                job.record
                    .params_with_input(&self.config.jobs.input_marker, LAUNCHER_INPUT_MARKER),
            )
            .env("ASAN_OPTIONS", triage.sanitizer_options.as_str())
            .log_to(&log);

        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(TriageError::CollectFailed {
                variant,
                status: output.describe(),
                log,
            });
        }
        Ok(())
    }
}

/// Moves the collector's gdb scripts out of the way into `<dir>/.scripts/`.
fn tidy_scripts(dir: &Path) -> Result<(), io::Error> {
    if !dir.is_dir() {
        return Ok(());
    }
    let scripts: Vec<_> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(SCRIPT_PREFIX))
        .collect();
    if scripts.is_empty() {
        return Ok(());
    }
    let dest = dir.join(SCRIPTS_DIR);
    fs::create_dir_all(&dest)?;
    for entry in scripts {
        fs::rename(entry.path(), dest.join(entry.file_name()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ScriptedDecisions;
    use crate::fingerprint::FingerprintAlgorithm;
    use crate::process::ProcessOutput;
    use crate::process::test_utils::FakeRunner;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        layout: WorkspaceLayout,
        config: DroverConfig,
        registry: JobRegistry,
        id: JobId,
    }

    fn fixture(debug_variants: &[Variant]) -> Fixture {
        let dir = tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path().join("ws"));
        layout.create().unwrap();
        for variant in debug_variants {
            let bin = BinarySet::Debug(*variant).binary_path(&layout, "prog");
            fs::create_dir_all(bin.parent().unwrap()).unwrap();
            fs::write(&bin, b"").unwrap();
        }
        let mut config = DroverConfig::default();
        config.supervisor.cores = Some(2);
        let mut registry = JobRegistry::open(&layout, FingerprintAlgorithm::Crc32).unwrap();
        let id = registry.create("prog --input @@").unwrap();
        Fixture {
            _dir: dir,
            layout,
            config,
            registry,
            id,
        }
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn copy_crashes(dir: &Path, out: &Path) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if !path.is_dir() {
                continue;
            }
            if path.file_name().unwrap() == "crashes" {
                for crash in fs::read_dir(&path).unwrap() {
                    let crash = crash.unwrap();
                    if crash.path().is_file() {
                        fs::copy(crash.path(), out.join(crash.file_name())).unwrap();
                    }
                }
            } else {
                copy_crashes(&path, out);
            }
        }
    }

    /// Behaves like the crash collector: copies every crash below the input into the
    /// output directory and leaves a gdb script next to them.
    fn fake_collector() -> FakeRunner {
        FakeRunner::new(|spec| {
            let input = Path::new(&spec.args[9]);
            let output = Path::new(&spec.args[10]);
            fs::create_dir_all(output).unwrap();
            copy_crashes(input, output);
            fs::write(output.join("gdb_script"), b"run").unwrap();
            ProcessOutput::exited(0)
        })
    }

    #[test]
    fn two_sessions_yield_two_unique_crashes() {
        let mut f = fixture(&[Variant::Harden, Variant::Asan]);
        let sync = f.layout.afl_out(&f.id);
        touch(&sync.join("SESSION000/crashes/id:000000,sig:11"));
        touch(&sync.join("SESSION001/crashes/id:000001,sig:06"));

        let mut runner = fake_collector();
        let mut decisions = ScriptedDecisions::always(false);
        let outcomes = CrashTriagePipeline::new(&f.layout, &f.config, &mut runner, &mut decisions)
            .triage(&mut f.registry, Some(&f.id))
            .unwrap();

        assert_eq!(
            outcomes,
            vec![TriageOutcome::Triaged {
                id: f.id.clone(),
                unique_crashes: 2,
                previous: None,
            }]
        );
        assert!(decisions.asked.is_empty());
        assert_eq!(runner.calls.len(), 3);

        let asan_dbg = BinarySet::Debug(Variant::Asan).binary_path(&f.layout, "prog");
        let last = &runner.calls[2];
        assert_eq!(last.args[9], f.layout.exploitable_dir(&f.id).to_str().unwrap());
        assert_eq!(last.args[12], asan_dbg.to_str().unwrap());
        assert_eq!(&last.args[13..], &["--input", "@@"]);
        assert_eq!(
            runner.calls[0].log_file.as_deref(),
            Some(f.layout.log_file("afl-harden_dbg.log").as_path())
        );
        assert!(runner.calls.iter().all(|c| {
            c.envs.contains(&(
                "ASAN_OPTIONS".to_string(),
                "abort_on_error=1:disable_coredump=1:symbolize=1".to_string(),
            ))
        }));

        let exploitable = f.layout.exploitable_dir(&f.id);
        assert_eq!(count_visible_entries(&exploitable.join("HARDEN/crashes")), 2);
        assert!(exploitable.join("ASAN/crashes/.scripts/gdb_script").is_file());
        let unique = f.layout.unique_dir(&f.id);
        assert!(unique.join(".scripts/gdb_script").is_file());
        assert_eq!(f.registry.get(&f.id).unwrap().state, JobState::Triaged);
    }

    #[test]
    fn declined_rerun_leaves_unique_untouched() {
        let mut f = fixture(&[Variant::Asan]);
        let unique = f.layout.unique_dir(&f.id);
        touch(&unique.join("id:000000"));

        let mut runner = fake_collector();
        let mut decisions = ScriptedDecisions::new([false]);
        let outcomes = CrashTriagePipeline::new(&f.layout, &f.config, &mut runner, &mut decisions)
            .triage(&mut f.registry, Some(&f.id))
            .unwrap();

        assert_eq!(
            outcomes,
            vec![TriageOutcome::Skipped { id: f.id.clone() }]
        );
        assert_eq!(decisions.asked, vec!["Rerun triaging?"]);
        assert!(runner.calls.is_empty());
        assert!(unique.join("id:000000").is_file());
        assert_eq!(f.registry.get(&f.id).unwrap().state, JobState::Created);
    }

    #[test]
    fn accepted_rerun_backs_up_previous_results() {
        let mut f = fixture(&[Variant::Asan]);
        let unique = f.layout.unique_dir(&f.id);
        touch(&unique.join("old-crash"));

        let mut runner = fake_collector();
        let mut decisions = ScriptedDecisions::always(true);
        let outcomes = CrashTriagePipeline::new(&f.layout, &f.config, &mut runner, &mut decisions)
            .triage(&mut f.registry, Some(&f.id))
            .unwrap();

        let TriageOutcome::Triaged {
            unique_crashes,
            previous: Some(previous),
            ..
        } = &outcomes[0]
        else {
            panic!("Expected a re-run, got {outcomes:?}");
        };
        assert_eq!(*unique_crashes, 0);
        assert!(previous.join("old-crash").is_file());
        assert!(
            previous
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("unique.")
        );
        assert!(unique.is_dir());
        assert!(!unique.join("old-crash").exists());
    }

    #[test]
    fn harden_only_replays_with_harden_binary() {
        let mut f = fixture(&[Variant::Harden]);
        touch(&f.layout.afl_out(&f.id).join("SESSION000/crashes/id:000000"));

        let mut runner = fake_collector();
        let mut decisions = ScriptedDecisions::always(false);
        CrashTriagePipeline::new(&f.layout, &f.config, &mut runner, &mut decisions)
            .triage(&mut f.registry, Some(&f.id))
            .unwrap();

        let harden_dbg = BinarySet::Debug(Variant::Harden).binary_path(&f.layout, "prog");
        assert_eq!(runner.calls.len(), 2);
        assert_eq!(runner.calls[1].args[12], harden_dbg.to_str().unwrap());
        assert_eq!(
            runner.calls[1].log_file.as_deref(),
            Some(f.layout.log_file("afl-harden_dbg_unique.log").as_path())
        );
    }

    #[test]
    fn collector_failure_is_reported() {
        let mut f = fixture(&[Variant::Asan]);
        let mut runner = FakeRunner::new(|_| ProcessOutput::exited(1));
        let mut decisions = ScriptedDecisions::always(false);
        let result = CrashTriagePipeline::new(&f.layout, &f.config, &mut runner, &mut decisions)
            .triage(&mut f.registry, Some(&f.id));
        assert!(matches!(
            result,
            Err(TriageError::CollectFailed {
                variant: Variant::Asan,
                ..
            })
        ));
    }

    #[test]
    fn without_id_every_job_is_triaged_in_order() {
        let mut f = fixture(&[Variant::Asan]);
        let second = f.registry.create("prog -f @@").unwrap();
        touch(&f.layout.unique_dir(&f.id).join("keep"));

        let mut runner = fake_collector();
        let mut decisions = ScriptedDecisions::new([false]);
        let outcomes = CrashTriagePipeline::new(&f.layout, &f.config, &mut runner, &mut decisions)
            .triage(&mut f.registry, None)
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0], TriageOutcome::Skipped { id: f.id.clone() });
        assert!(matches!(
            &outcomes[1],
            TriageOutcome::Triaged { id, .. } if *id == second
        ));
        assert_eq!(f.registry.get(&second).unwrap().state, JobState::Triaged);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let mut f = fixture(&[]);
        let mut runner = FakeRunner::succeeding();
        let mut decisions = ScriptedDecisions::always(false);
        let result = CrashTriagePipeline::new(&f.layout, &f.config, &mut runner, &mut decisions)
            .triage(&mut f.registry, Some(&JobId::from("missing")));
        assert!(matches!(
            result,
            Err(TriageError::Registry(RegistryError::JobNotFound(_)))
        ));
    }
}
