use crate::process::{ProcessError, ProcessRunner, ProcessSpec};
use crate::variant::BinarySet;
use crate::workspace::WorkspaceLayout;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Building {set} failed ({status}), see {log:?}")]
    Failed {
        set: String,
        status: String,
        log: PathBuf,
    },

    #[error("Build I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl From<io::Error> for BuildError {
    fn from(err: io::Error) -> Self {
        BuildError::Io(err.to_string())
    }
}

/// Installs one binary set into the workspace.
pub trait BinaryBuilder {
    fn build(&mut self, layout: &WorkspaceLayout, set: BinarySet) -> Result<(), BuildError>;
}

/// Runs the configured build command once per binary set.
///
/// The command receives `DROVER_BINARY_SET` (e.g. `afl-asan`) and `DROVER_PREFIX` (the
/// install directory, whose `bin/` must end up holding the target). With no command
/// configured the install directory is only created, for binaries installed by hand.
pub struct CommandBuilder<R: ProcessRunner> {
    command: Vec<String>,
    runner: R,
}

impl<R: ProcessRunner> CommandBuilder<R> {
    pub fn new(command: Vec<String>, runner: R) -> Self {
        Self { command, runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }
}

impl<R: ProcessRunner> BinaryBuilder for CommandBuilder<R> {
    fn build(&mut self, layout: &WorkspaceLayout, set: BinarySet) -> Result<(), BuildError> {
        let prefix = set.install_dir(layout);
        fs::create_dir_all(prefix.join("bin"))?;

        let Some((program, args)) = self.command.split_first() else {
            log::warn!(
                "no build command configured, install {} binaries into {}",
                set.dir_name(),
                prefix.display()
            );
            return Ok(());
        };

        let log = layout.log_file(&format!("build-{}.log", set.dir_name()));
        let spec = ProcessSpec::new(program.as_str())
            .args(args.iter().map(String::as_str))
            .env("DROVER_BINARY_SET", set.dir_name())
            .env("DROVER_PREFIX", prefix.to_string_lossy())
            .log_to(&log);

        log::info!("building {} binaries", set.dir_name());
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(BuildError::Failed {
                set: set.dir_name(),
                status: output.describe(),
                log,
            });
        }
        Ok(())
    }
}
