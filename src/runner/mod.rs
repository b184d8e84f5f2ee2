//! Process execution behind the narrow [CommandRunner] capability.
//!
//! The engine never touches [std::process] directly; everything goes through
//! a runner so tests can script subprocess behaviour.

mod system;

use std::ffi::{OsStr, OsString};
use std::io;
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::cancel::CancelToken;

pub use system::SystemRunner;

/// Executes one external command to completion.
pub trait CommandRunner: Send + Sync {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RunnerError>;
}

/// A single command invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Program followed by its arguments.
    pub argv: Vec<OsString>,
    /// Bytes fed to the child's stdin, if any.
    pub stdin: Option<Vec<u8>>,
    /// Maximum wall-clock duration before the child is killed.
    pub timeout: Duration,
    /// When set, raising the token kills the child.
    pub cancel: Option<CancelToken>,
}

impl CommandRequest {
    pub fn new(program: impl AsRef<OsStr>, timeout: Duration) -> Self {
        Self {
            argv: vec![program.as_ref().to_os_string()],
            stdin: None,
            timeout,
            cancel: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.argv.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.argv
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn cancel_with(mut self, token: Option<CancelToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Name of the program, lossily decoded.
    pub fn program(&self) -> String {
        self.argv
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Space separated command line for log output.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, [None] when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Display, Error, From)]
/// Failures to run a command at all, as opposed to a command that ran and
/// exited non-zero.
pub enum RunnerError {
    /// The request had no program.
    #[display("Empty command line")]
    EmptyCommand,
    /// The program could not be started.
    #[display("Failed to spawn `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    /// The child exceeded its timeout and was killed.
    #[display("Command exceeded its timeout of {timeout:?} and was killed")]
    TimedOut { timeout: Duration, stderr: Vec<u8> },
    /// The child was killed because cancellation was raised.
    #[display("Command was killed on cancellation")]
    Cancelled,
    /// Waiting on the child failed.
    #[from]
    #[display("Waiting for command failed: {_0}")]
    Io(io::Error),
}
