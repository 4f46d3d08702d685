//! Process seam for external tools.
//!
//! Stages never spawn processes themselves; they go through a [`ToolRunner`]
//! so tests can substitute a fake that records invocations and writes output
//! files.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::path_plan::ensure_parent_dir;

/// Where the child's stdout/stderr go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Collected in memory
    Capture,
    /// Appended to a log file
    AppendTo(PathBuf),
    /// Inherited from this process (progress bars)
    Inherit,
}

/// A fully rendered command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<OsString>,
    pub output_mode: OutputMode,
    /// Working directory of the child; inherited when `None`
    pub current_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            output_mode: OutputMode::Capture,
            current_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Arguments as lossy strings, for logging and assertions
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in self.args_lossy() {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(&arg);
                line.push('"');
            } else {
                line.push_str(&arg);
            }
        }
        line
    }
}

/// Result of running a child process to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code; `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            status: Some(code),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a command to completion, blocking the calling worker
pub trait ToolRunner: Send + Sync {
    fn run(&self, command: &ToolCommand) -> io::Result<RunOutput>;
}

/// Runs commands with `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn build(command: &ToolCommand) -> Command {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        // Tools such as ffmpeg read keyboard input from stdin
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl ToolRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> io::Result<RunOutput> {
        let mut cmd = Self::build(command);

        match &command.output_mode {
            OutputMode::Capture => {
                let output = cmd.output()?;
                Ok(RunOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            OutputMode::AppendTo(log_path) => {
                ensure_parent_dir(log_path)?;
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_path)?;
                let log_err = log.try_clone()?;
                let status = cmd
                    .stdout(Stdio::from(log))
                    .stderr(Stdio::from(log_err))
                    .status()?;
                Ok(RunOutput {
                    status: status.code(),
                    ..RunOutput::default()
                })
            }
            OutputMode::Inherit => {
                let status = cmd.status()?;
                Ok(RunOutput {
                    status: status.code(),
                    ..RunOutput::default()
                })
            }
        }
    }
}
