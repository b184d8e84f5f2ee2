//! Bounded retries with exponential backoff.
//!
//! Failures are classified as [FailureClass::Retryable] or
//! [FailureClass::Fatal]. Every retry is a fresh attempt; partial artifacts
//! are never resumed.

use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use rand::Rng;
use regex::RegexSet;

use crate::backends::{AttemptOutcome, RunAttempt};
use crate::cancel::CancelToken;
use crate::error::BackupError;
use crate::verify::IntegrityError;

/// Longest uninterrupted sleep while waiting for the next attempt.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// stderr of tools that failed for reasons a retry won't fix.
static FATAL_STDERR: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)access denied",
        r"(?i)authentication (failed|plugin)",
        r"(?i)unknown database",
        r"(?i)no space left on device",
        r"(?i)disk (is )?full",
        r"(?i)permission denied",
        r"(?i)no such file or directory",
        r"(?i)read-only file system",
        r"(?i)unknown (option|variable)",
    ])
    .expect("fatal stderr patterns should be valid")
});

/// stderr of tools that hit a transient condition.
static TRANSIENT_STDERR: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)connection refused",
        r"(?i)can't connect",
        r"(?i)lost connection",
        r"(?i)resource temporarily unavailable",
        r"(?i)too many connections",
        r"(?i)lock wait timeout",
        r"(?i)deadlock",
        r"(?i)server has gone away",
    ])
    .expect("transient stderr patterns should be valid")
});

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Fatal,
}

/// Classifies a single failure without regard to earlier attempts.
///
/// Unrecognised command failures and I/O errors count as retryable; the retry
/// budget bounds the cost of a wrong guess.
pub fn classify(err: &BackupError) -> FailureClass {
    match err {
        BackupError::InvalidTarget(_)
        | BackupError::CredentialsUnavailable(_)
        | BackupError::AlreadyInProgress { .. }
        | BackupError::StoreWriteFailure(_)
        | BackupError::Cancelled => FailureClass::Fatal,
        BackupError::ExecutionFailed { stderr_tail, .. } => classify_stderr(stderr_tail),
        BackupError::TimedOut { .. } | BackupError::EmptyArtifact => FailureClass::Retryable,
        BackupError::Integrity(IntegrityError::Read(e)) | BackupError::Io(e) => classify_io(e),
        BackupError::Integrity(_) => FailureClass::Retryable,
        BackupError::Spawn { source, .. } => match source.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                FailureClass::Fatal
            }
            _ => classify_io(source),
        },
    }
}

fn classify_stderr(stderr: &str) -> FailureClass {
    if FATAL_STDERR.is_match(stderr) {
        FailureClass::Fatal
    } else {
        if !TRANSIENT_STDERR.is_match(stderr) {
            log::debug!(target: "retry", "Unrecognised failure treated as transient: {stderr}");
        }
        FailureClass::Retryable
    }
}

fn classify_io(err: &std::io::Error) -> FailureClass {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::StorageFull
        | ErrorKind::PermissionDenied
        | ErrorKind::NotFound
        | ErrorKind::ReadOnlyFilesystem
        | ErrorKind::InvalidInput => FailureClass::Fatal,
        _ => FailureClass::Retryable,
    }
}

/// Failures that count toward the "transient once, fatal on repeat" rule.
fn is_validation_failure(err: &BackupError) -> bool {
    matches!(
        err,
        BackupError::EmptyArtifact
            | BackupError::Integrity(
                IntegrityError::TooSmall { .. }
                    | IntegrityError::Mismatch { .. }
                    | IntegrityError::Truncated
            )
    )
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// How often and how patiently to retry.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every further one.
    pub base_delay_ms: u64,
    /// Upper bound on a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (1-based).
    ///
    /// Half of the exponential delay is fixed, the other half is random.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(32))
            .min(self.max_delay_ms);
        let half = exp / 2;
        let jitter = if exp > half {
            rand::thread_rng().gen_range(0..=exp - half)
        } else {
            0
        };
        Duration::from_millis(half + jitter)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TerminalOutcome {
    Success,
    RetriesExhausted,
    Fatal,
    Cancelled,
}

/// Result of driving a target through its attempts.
#[derive(Debug)]
pub struct Finished {
    pub outcome: TerminalOutcome,
    /// Number of attempts started.
    pub attempts: u32,
    /// The last attempt; [None] if cancellation prevented the first one.
    pub last: Option<RunAttempt>,
}

#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy, cancel: CancelToken) -> Self {
        Self { policy, cancel }
    }

    /// Runs `execute` with attempt numbers 1, 2, ... until it succeeds, fails
    /// fatally, the attempt budget is used up, or cancellation is raised.
    ///
    /// Attempts are strictly sequential.
    pub fn execute_with_retry<F>(&self, target_id: &str, mut execute: F) -> Finished
    where
        F: FnMut(u32) -> RunAttempt,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut validation_failures = 0;
        let mut last = None;

        for number in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                log::info!(target: "retry", "{target_id}: not starting attempt {number}, cancelled");
                return Finished {
                    outcome: TerminalOutcome::Cancelled,
                    attempts: number - 1,
                    last,
                };
            }

            let mut attempt = execute(number);
            let escalate = match &attempt.outcome {
                AttemptOutcome::RetryableFailure(err) if is_validation_failure(err) => {
                    validation_failures += 1;
                    validation_failures > 1
                }
                _ => false,
            };
            if escalate {
                attempt.outcome = match std::mem::replace(&mut attempt.outcome, AttemptOutcome::Cancelled) {
                    AttemptOutcome::RetryableFailure(err) => AttemptOutcome::FatalFailure(err),
                    other => other,
                };
            }

            let outcome = match &attempt.outcome {
                AttemptOutcome::Success => Some(TerminalOutcome::Success),
                AttemptOutcome::Cancelled => Some(TerminalOutcome::Cancelled),
                AttemptOutcome::FatalFailure(err) => {
                    log::error!(target: "retry", "{target_id}: attempt {number} failed fatally: {err}");
                    Some(TerminalOutcome::Fatal)
                }
                AttemptOutcome::RetryableFailure(err) => {
                    log::warn!(target: "retry", "{target_id}: attempt {number}/{max_attempts} failed: {err}");
                    None
                }
            };
            if let Some(outcome) = outcome {
                return Finished {
                    outcome,
                    attempts: number,
                    last: Some(attempt),
                };
            }
            last = Some(attempt);

            if number < max_attempts {
                let delay = self.policy.backoff(number);
                log::debug!(target: "retry", "{target_id}: retrying in {delay:?}");
                if !self.wait(delay) {
                    log::info!(target: "retry", "{target_id}: cancelled while backing off");
                    return Finished {
                        outcome: TerminalOutcome::Cancelled,
                        attempts: number,
                        last,
                    };
                }
            }
        }

        log::error!(target: "retry", "{target_id}: giving up after {max_attempts} attempts");
        Finished {
            outcome: TerminalOutcome::RetriesExhausted,
            attempts: max_attempts,
            last,
        }
    }

    /// Sleeps for `delay`; returns `false` if cancellation cut the wait short.
    fn wait(&self, delay: Duration) -> bool {
        let mut remaining = delay;
        while !remaining.is_zero() {
            if self.cancel.is_cancelled() {
                return false;
            }
            let step = remaining.min(CANCEL_POLL);
            thread::sleep(step);
            remaining -= step;
        }
        !self.cancel.is_cancelled()
    }
}
