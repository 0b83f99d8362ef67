use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn command '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("Failed to open log file {path:?}: {message}")]
    LogFile { path: PathBuf, message: String },

    #[error("Error waiting for child: {0}")]
    Wait(String),
}

/// Everything needed to launch one external process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// When set, stdout and stderr go to this file instead of being captured.
    pub log_file: Option<PathBuf>,
    /// When unset the call blocks until the process exits on its own.
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human readable command line, for logs only.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: ProcessStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            status: ProcessStatus::Exited(code),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn success(&self) -> bool {
        self.status == ProcessStatus::Exited(0)
    }

    pub fn describe(&self) -> String {
        match self.status {
            ProcessStatus::Exited(code) => format!("Exited with code {code}"),
            ProcessStatus::Signaled(signal) => format!("Terminated by signal {signal}"),
            ProcessStatus::TimedOut => "Timed out".to_string(),
        }
    }
}

/// Process execution seam for the supervisor, triage and status components.
pub trait ProcessRunner {
    /// Runs the process to completion.
    fn run(&mut self, spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError>;

    /// Starts the process and returns its pid without waiting for it.
    fn spawn_detached(&mut self, spec: &ProcessSpec) -> Result<u32, ProcessError>;
}

/// Runs processes on the host with `std::process`.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }

    fn build_command(spec: &ProcessSpec) -> Result<Command, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(spec.envs.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null());

        match &spec.log_file {
            Some(path) => {
                let log_err = |e: io::Error| ProcessError::LogFile {
                    path: path.clone(),
                    message: e.to_string(),
                };
                let file = File::create(path).map_err(log_err)?;
                let file_err = file.try_clone().map_err(log_err)?;
                cmd.stdout(Stdio::from(file));
                cmd.stderr(Stdio::from(file_err));
            }
            None => {
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
            }
        }
        Ok(cmd)
    }

    fn spawn(spec: &ProcessSpec) -> Result<Child, ProcessError> {
        Self::build_command(spec)?
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                program: spec.program.clone(),
                message: e.to_string(),
            })
    }

    fn run_and_wait_with_timeout(
        child: &mut Child,
        timeout: Option<Duration>,
    ) -> Result<ProcessStatus, ProcessError> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Self::convert_status(status)),
                Ok(None) => {
                    if timeout.is_some_and(|t| start_time.elapsed() > t) {
                        log::warn!("process timed out, killing...");
                        child
                            .kill()
                            .map_err(|e| ProcessError::Wait(format!("Failed to kill: {e}")))?;
                        let _ = child.wait();
                        return Ok(ProcessStatus::TimedOut);
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(ProcessError::Wait(e.to_string())),
            }
        }
    }

    fn convert_status(status: std::process::ExitStatus) -> ProcessStatus {
        if let Some(code) = status.code() {
            return ProcessStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ProcessStatus::Signaled(signal);
            }
        }
        ProcessStatus::Exited(-1)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

impl ProcessRunner for SystemRunner {
    fn run(&mut self, spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError> {
        log::debug!("running: {}", spec.command_line());
        let mut child = Self::spawn(spec)?;

        // Pipes are drained on their own threads so a chatty child cannot block on a
        // full pipe while we poll for its exit.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = Self::run_and_wait_with_timeout(&mut child, spec.timeout)?;

        Ok(ProcessOutput {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    fn spawn_detached(&mut self, spec: &ProcessSpec) -> Result<u32, ProcessError> {
        log::debug!("spawning: {}", spec.command_line());
        let mut detached = spec.clone();
        if detached.log_file.is_none() {
            // Nobody reads the pipes of a detached child.
            detached.log_file = Some(PathBuf::from("/dev/null"));
        }
        let child = Self::spawn(&detached)?;
        Ok(child.id())
    }
}
