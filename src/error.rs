//! Failure taxonomy shared by all components.
//!
//! Errors are caught at the attempt boundary and classified by
//! [classify](crate::retry::classify); they never escape a target's run.

use std::io;
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::credentials::CredentialsUnavailable;
use crate::manifest::StoreError;
use crate::runner::RunnerError;
use crate::target::InvalidTarget;
use crate::verify::IntegrityError;

/// Maximum number of stderr bytes kept in [BackupError::ExecutionFailed].
const STDERR_TAIL_BYTES: usize = 2048;
/// Maximum number of stderr lines kept in [BackupError::ExecutionFailed].
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Display, Error, From)]
pub enum BackupError {
    /// The request doesn't describe a backup-able target.
    #[from]
    #[display("Invalid target: {_0}")]
    InvalidTarget(InvalidTarget),
    /// The copy or dump process exited non-zero.
    ///
    /// `exit_code` is `-1` when the process was terminated by a signal.
    #[display("Command exited with status {exit_code}: {stderr_tail}")]
    ExecutionFailed { exit_code: i32, stderr_tail: String },
    /// The attempt exceeded its maximum duration.
    #[display("Attempt exceeded its timeout of {timeout:?}")]
    TimedOut { timeout: Duration },
    /// The process succeeded but wrote nothing for a non-empty source.
    #[display("Backup produced an empty artifact")]
    EmptyArtifact,
    #[from]
    #[display("{_0}")]
    Integrity(IntegrityError),
    #[from]
    #[display("{_0}")]
    CredentialsUnavailable(CredentialsUnavailable),
    /// Another run of the same target is in flight.
    #[display("A backup of `{target_id}` is already in progress")]
    AlreadyInProgress { target_id: String },
    #[from]
    #[display("Writing the manifest failed: {_0}")]
    StoreWriteFailure(StoreError),
    /// The copy or dump program couldn't be started.
    #[display("Failed to start `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    #[from]
    #[display("I/O error: {_0}")]
    Io(io::Error),
    /// Cancellation was raised before or during the attempt.
    #[display("Cancelled")]
    Cancelled,
}

impl BackupError {
    /// Builds [BackupError::ExecutionFailed] from a failed process.
    pub fn execution_failed(exit_code: Option<i32>, stderr: &[u8]) -> Self {
        Self::ExecutionFailed {
            exit_code: exit_code.unwrap_or(-1),
            stderr_tail: stderr_tail(stderr),
        }
    }
}

impl From<RunnerError> for BackupError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::EmptyCommand => Self::Spawn {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
            },
            RunnerError::Spawn { program, source } => Self::Spawn { program, source },
            RunnerError::TimedOut { timeout, .. } => Self::TimedOut { timeout },
            RunnerError::Cancelled => Self::Cancelled,
            RunnerError::Io(e) => Self::Io(e),
        }
    }
}

/// Last lines of a process' stderr, lossily decoded.
pub fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    let text = String::from_utf8_lossy(&stderr[start..]);
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let skip = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[skip..].join("\n")
}
