//! Backends producing one artifact per attempt.
//!
//! Currently the following backends are implemented:
//!
//! - [FileCopy]: attribute-preserving copy of a file or directory tree.
//! - [MariaDb]: single-transaction dump of a MySQL/MariaDB instance.
//!
//! Both stage their output in a target-scoped temporary directory next to
//! the destination. The [SnapshotExecutor] verifies the staged artifact and
//! only then renames it into its final place, so a crash mid-copy never
//! leaves a corrupt artifact at the expected location.

pub mod copy;
pub mod mariadb;

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub use copy::FileCopy;
pub use mariadb::MariaDb;

use crate::cancel::{CancelPolicy, CancelToken};
use crate::config::BackupConfig;
use crate::credentials::CredentialProvider;
use crate::error::BackupError;
use crate::retry::{classify, FailureClass};
use crate::runner::CommandRunner;
use crate::target::{Target, TargetKind};
use crate::verify::{Checksum, Expected, IntegrityVerifier, Verified};

/// Name under which a replaced directory artifact is parked during publish.
const PREVIOUS: &str = "previous";

/// How an attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure(BackupError),
    FatalFailure(BackupError),
    /// The subprocess was killed on cancellation.
    Cancelled,
}

/// Record of one execution attempt.
#[derive(Debug)]
pub struct RunAttempt {
    pub target_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Exit code of the copy or dump process, if it ran to completion.
    pub exit_status: Option<i32>,
    /// Final artifact location of this attempt.
    pub artifact_path: PathBuf,
    pub bytes_written: u64,
    pub checksum: Option<Checksum>,
    pub outcome: AttemptOutcome,
}

impl RunAttempt {
    pub fn error(&self) -> Option<&BackupError> {
        match &self.outcome {
            AttemptOutcome::RetryableFailure(e) | AttemptOutcome::FatalFailure(e) => Some(e),
            AttemptOutcome::Success | AttemptOutcome::Cancelled => None,
        }
    }
}

/// Generic backup backend.
pub trait Backup: Send + Sync {
    /// File name of the artifact an attempt started at `started_at`
    /// publishes for `target`.
    fn artifact_name(&self, target: &Target, started_at: DateTime<Utc>) -> OsString;

    /// Produces the artifact of `target` inside `staging`.
    ///
    /// Nothing outside of `staging` may be modified.
    fn stage(
        &self,
        target: &Target,
        staging: &Staging,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Staged, BackupError>;
}

/// Everything a backend needs to run its command.
pub struct ExecutionContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub credentials: &'a dyn CredentialProvider,
    pub timeout: Duration,
    /// Kill token handed to the runner; [None] lets processes finish.
    pub cancel: Option<CancelToken>,
}

/// Output of a backend, still inside the staging directory.
#[derive(Debug)]
pub struct Staged {
    pub path: PathBuf,
    pub exit_status: Option<i32>,
    pub expected: Expected,
}

/// Target-scoped scratch directory. Emptied before every attempt.
#[derive(Debug)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    fn prepare(dir: PathBuf) -> io::Result<Self> {
        if dir.exists() {
            log::debug!(target: "backend", "Removing leftovers in {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn clear(self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            log::warn!(target: "backend", "Cleaning up {} failed: {e}", self.dir.display());
        }
        // succeeds only once no other target stages next to us
        if let Some(root) = self.dir.parent() {
            let _ = fs::remove_dir(root);
        }
    }
}

/// Executes single attempts: stage, verify, publish.
pub struct SnapshotExecutor {
    runner: Arc<dyn CommandRunner>,
    credentials: Arc<dyn CredentialProvider>,
    verifier: IntegrityVerifier,
    copy: FileCopy,
    mariadb: MariaDb,
    staging_dir_name: String,
    timeout: Duration,
    cancel: CancelToken,
    cancel_policy: CancelPolicy,
}

impl SnapshotExecutor {
    pub fn new(
        config: &BackupConfig,
        runner: Arc<dyn CommandRunner>,
        credentials: Arc<dyn CredentialProvider>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            runner,
            credentials,
            verifier: IntegrityVerifier::new(config.integrity),
            copy: FileCopy::new(config.verify_against_source, config.integrity.min_file_size),
            mariadb: MariaDb::new(config.dump.clone(), config.integrity),
            staging_dir_name: config.staging_dir_name.clone(),
            timeout: config.attempt_timeout(),
            cancel,
            cancel_policy: config.cancel_policy,
        }
    }

    pub fn verifier(&self) -> &IntegrityVerifier {
        &self.verifier
    }

    fn backend(&self, target: &Target) -> &dyn Backup {
        match target.kind() {
            TargetKind::File { .. } | TargetKind::Directory { .. } => &self.copy,
            TargetKind::Database { .. } => &self.mariadb,
        }
    }

    /// Where an attempt started at `started_at` publishes its artifact.
    pub fn artifact_path(&self, target: &Target, started_at: DateTime<Utc>) -> PathBuf {
        target
            .destination()
            .join(self.backend(target).artifact_name(target, started_at))
    }

    /// Runs attempt number `number` for `target`.
    ///
    /// Never fails; errors are classified into the attempt's outcome.
    pub fn execute(&self, target: &Target, number: u32) -> RunAttempt {
        let started_at = Utc::now();
        let artifact_path = self.artifact_path(target, started_at);
        log::debug!(target: "backend", "{}: attempt {number} publishing to {}", target.id(), artifact_path.display());

        let result = self.attempt(target, &artifact_path);
        let finished_at = Utc::now();

        let mut attempt = RunAttempt {
            target_id: target.id().to_string(),
            attempt: number,
            started_at,
            finished_at,
            exit_status: None,
            artifact_path,
            bytes_written: 0,
            checksum: None,
            outcome: AttemptOutcome::Success,
        };
        match result {
            Ok((verified, exit_status)) => {
                attempt.exit_status = exit_status;
                attempt.bytes_written = verified.size;
                attempt.checksum = Some(verified.checksum);
            }
            Err(BackupError::Cancelled) => attempt.outcome = AttemptOutcome::Cancelled,
            Err(err) => {
                if let BackupError::ExecutionFailed { exit_code, .. } = &err {
                    attempt.exit_status = Some(*exit_code);
                }
                attempt.outcome = match classify(&err) {
                    FailureClass::Retryable => AttemptOutcome::RetryableFailure(err),
                    FailureClass::Fatal => AttemptOutcome::FatalFailure(err),
                };
            }
        }
        attempt
    }

    fn attempt(
        &self,
        target: &Target,
        artifact_path: &Path,
    ) -> Result<(Verified, Option<i32>), BackupError> {
        fs::create_dir_all(target.destination())?;
        let staging = Staging::prepare(
            target
                .destination()
                .join(&self.staging_dir_name)
                .join(target.key()),
        )?;

        let ctx = ExecutionContext {
            runner: self.runner.as_ref(),
            credentials: self.credentials.as_ref(),
            timeout: self.timeout,
            cancel: (self.cancel_policy == CancelPolicy::Kill).then(|| self.cancel.clone()),
        };

        let result = self.stage_and_publish(target, &staging, &ctx, artifact_path);
        staging.clear();
        result
    }

    fn stage_and_publish(
        &self,
        target: &Target,
        staging: &Staging,
        ctx: &ExecutionContext<'_>,
        artifact_path: &Path,
    ) -> Result<(Verified, Option<i32>), BackupError> {
        let staged = self.backend(target).stage(target, staging, ctx)?;
        log::trace!(target: "backend", "{}: staged {}", target.id(), staged.path.display());

        let verified = self.verifier.verify(&staged.path, &staged.expected)?;
        publish(&staged.path, artifact_path, staging)?;
        log::info!(target: "backend", "{}: published {} ({} bytes)", target.id(), artifact_path.display(), verified.size);

        Ok((verified, staged.exit_status))
    }
}

/// Atomically moves `staged` to `artifact`.
///
/// A file replaces an existing file in one rename. An existing directory (or a
/// change between file and directory) is first parked inside `staging`; the
/// artifact path is then briefly absent but never partially written.
fn publish(staged: &Path, artifact: &Path, staging: &Staging) -> io::Result<()> {
    if let Ok(meta) = fs::symlink_metadata(staged) {
        if meta.is_file() {
            File::open(staged)?.sync_all()?;
        }
    }

    let existing = fs::symlink_metadata(artifact).ok();
    let needs_parking = match &existing {
        Some(meta) => meta.is_dir() || staged.is_dir(),
        None => false,
    };

    if needs_parking {
        let previous = staging.path(PREVIOUS);
        log::debug!(target: "backend", "Parking previous artifact {}", artifact.display());
        fs::rename(artifact, &previous)?;
        if let Err(e) = fs::rename(staged, artifact) {
            let _ = fs::rename(&previous, artifact);
            return Err(e);
        }
    } else {
        fs::rename(staged, artifact)?;
    }

    sync_dir(artifact.parent());
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: Option<&Path>) {
    if let Some(dir) = dir.filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            log::debug!(target: "backend", "Syncing {} failed: {e}", dir.display());
        }
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: Option<&Path>) {}
