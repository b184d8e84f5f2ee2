//! Top-level coordination of a backup run.
//!
//! [BackupOrchestrator::run_all] resolves every request, claims the target's
//! identity in the in-flight registry and hands the claimed targets to a pool
//! of worker threads. Each worker drives one target at a time through its
//! attempts and records the terminal outcome in the manifest. Failures are
//! contained per target; the batch always runs to completion.

use std::collections::{HashSet, VecDeque};
use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};
use derive_more::Display;

use crate::backends::{AttemptOutcome, SnapshotExecutor};
use crate::cancel::CancelToken;
use crate::config::BackupConfig;
use crate::credentials::CredentialProvider;
use crate::error::BackupError;
use crate::manifest::{ManifestEntry, ManifestOutcome, ManifestStore, StoreError};
use crate::retry::{Finished, RetryCoordinator, TerminalOutcome};
use crate::runner::CommandRunner;
use crate::target::{Target, TargetRequest, TargetResolver};

/// Called for every artifact that was published or confirmed unchanged.
///
/// Errors are logged and don't affect the target's outcome.
pub trait PublishHook: Send + Sync {
    fn published(
        &self,
        target: &Target,
        entry: &ManifestEntry,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum TargetOutcome {
    #[display("success")]
    Success,
    #[display("unchanged")]
    Unchanged,
    #[display("retries exhausted")]
    RetriesExhausted,
    #[display("fatal")]
    Fatal,
    #[display("cancelled")]
    Cancelled,
    #[display("already in progress")]
    AlreadyInProgress,
    #[display("invalid target")]
    InvalidTarget,
}

impl TargetOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::Unchanged)
    }
}

impl From<ManifestOutcome> for TargetOutcome {
    fn from(outcome: ManifestOutcome) -> Self {
        match outcome {
            ManifestOutcome::Success => Self::Success,
            ManifestOutcome::Unchanged => Self::Unchanged,
            ManifestOutcome::RetriesExhausted => Self::RetriesExhausted,
            ManifestOutcome::Fatal => Self::Fatal,
            ManifestOutcome::Cancelled => Self::Cancelled,
        }
    }
}

/// Outcome of a single request.
#[derive(Debug)]
pub struct TargetReport {
    /// The request as given by the caller.
    pub request: String,
    /// [None] if the request could not be resolved.
    pub target_id: Option<String>,
    pub outcome: TargetOutcome,
    pub attempts: u32,
    /// Error of the last failed attempt.
    pub error: Option<BackupError>,
    /// The recorded manifest entry.
    pub entry: Option<ManifestEntry>,
}

impl TargetReport {
    fn rejected(request: &TargetRequest, target_id: Option<&str>, error: BackupError) -> Self {
        let outcome = match &error {
            BackupError::AlreadyInProgress { .. } => TargetOutcome::AlreadyInProgress,
            BackupError::InvalidTarget(_) => TargetOutcome::InvalidTarget,
            _ => TargetOutcome::Fatal,
        };
        Self {
            request: request.to_string(),
            target_id: target_id.map(str::to_string),
            outcome,
            attempts: 0,
            error: Some(error),
            entry: None,
        }
    }
}

/// Result of one [BackupOrchestrator::run_all] call.
#[derive(Debug)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One report per request, in request order.
    pub targets: Vec<TargetReport>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.targets.iter().all(|t| t.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| !t.outcome.is_success())
    }
}

/// Claim on a target identity. Released on drop.
struct InFlight<'a> {
    registry: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn acquire(registry: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let mut running = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            registry,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

struct Job<'a> {
    index: usize,
    request: &'a TargetRequest,
    target: Target,
    claims: Vec<InFlight<'a>>,
}

pub struct BackupOrchestrator {
    parallelism: usize,
    skip_unchanged: bool,
    resolver: TargetResolver,
    executor: SnapshotExecutor,
    retry: RetryCoordinator,
    manifest: ManifestStore,
    in_flight: Mutex<HashSet<String>>,
    cancel: CancelToken,
    hooks: Vec<Box<dyn PublishHook>>,
}

impl BackupOrchestrator {
    /// Creates an orchestrator and opens the manifest named by `config`.
    pub fn new(
        config: &BackupConfig,
        runner: Arc<dyn CommandRunner>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, StoreError> {
        let manifest = ManifestStore::open(&config.manifest_path())?;
        let cancel = CancelToken::new();

        Ok(Self {
            parallelism: config.parallelism.max(1),
            skip_unchanged: config.skip_unchanged,
            resolver: TargetResolver::new(
                config.databases.clone(),
                config.destination().to_path_buf(),
                Arc::clone(&credentials),
            ),
            executor: SnapshotExecutor::new(config, runner, credentials, cancel.clone()),
            retry: RetryCoordinator::new(config.retry, cancel.clone()),
            manifest,
            in_flight: Mutex::default(),
            cancel,
            hooks: Vec::new(),
        })
    }

    pub fn add_hook(&mut self, hook: Box<dyn PublishHook>) {
        self.hooks.push(hook);
    }

    /// Token that stops the run when raised.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// Latest successful manifest entry for the target `request` names.
    pub fn last_backup(&self, request: &TargetRequest) -> Result<Option<ManifestEntry>, BackupError> {
        let target = self.resolver.resolve(request)?;
        Ok(self.manifest.last_success(target.id()))
    }

    /// Backs up every request and reports each outcome.
    ///
    /// A request whose target is already being backed up, by this or a
    /// concurrent call, is rejected with [BackupError::AlreadyInProgress].
    pub fn run_all(&self, requests: &[TargetRequest]) -> RunReport {
        let started_at = Utc::now();
        log::info!(target: "orchestrator", "Backing up {} target(s)", requests.len());

        let mut reports = Vec::with_capacity(requests.len());
        let mut jobs = VecDeque::new();
        for (index, request) in requests.iter().enumerate() {
            match self.claim(request) {
                Ok((target, claims)) => {
                    jobs.push_back(Job {
                        index,
                        request,
                        target,
                        claims,
                    });
                    reports.push(None);
                }
                Err(report) => reports.push(Some(report)),
            }
        }

        let workers = self.parallelism.min(jobs.len());
        log::debug!(target: "orchestrator", "Running {} target(s) on {workers} worker(s)", jobs.len());
        let queue = Mutex::new(jobs);
        let reports = Mutex::new(reports);
        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let job = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(job) = job else { break };

                    let index = job.index;
                    let report = self.run_job(job);
                    reports.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(report);
                });
            }
        });

        let targets: Vec<TargetReport> = reports
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect();
        let failed = targets.iter().filter(|t| !t.outcome.is_success()).count();
        if failed > 0 {
            log::warn!(target: "orchestrator", "{failed} of {} target(s) failed", targets.len());
        } else {
            log::info!(target: "orchestrator", "All {} target(s) backed up", targets.len());
        }

        RunReport {
            started_at,
            finished_at: Utc::now(),
            targets,
        }
    }

    /// Resolves `request` and claims its identity and, for copies, its
    /// artifact path.
    ///
    /// A copy whose plain artifact name belongs to another source, in the
    /// manifest or in this run, publishes under [Target::with_unique_name].
    fn claim(&self, request: &TargetRequest) -> Result<(Target, Vec<InFlight<'_>>), TargetReport> {
        let target = self.resolver.resolve(request).map_err(|err| {
            log::error!(target: "orchestrator", "{request}: {err}");
            TargetReport::rejected(request, None, err)
        })?;

        let in_progress = |target: &Target| {
            log::warn!(target: "orchestrator", "{request}: {} is already in progress", target.id());
            let err = BackupError::AlreadyInProgress {
                target_id: target.id().to_string(),
            };
            TargetReport::rejected(request, Some(target.id()), err)
        };

        let Some(identity) = InFlight::acquire(&self.in_flight, target.id()) else {
            return Err(in_progress(&target));
        };
        if target.source_path().is_none() {
            return Ok((target, vec![identity]));
        }

        if let Some(artifact) = self.claim_artifact(&target) {
            return Ok((target, vec![identity, artifact]));
        }
        let target = target.with_unique_name();
        log::info!(target: "orchestrator", "{request}: artifact name taken, publishing as {}", target.name().to_string_lossy());
        match self.claim_artifact(&target) {
            Some(artifact) => Ok((target, vec![identity, artifact])),
            None => Err(in_progress(&target)),
        }
    }

    /// Claims the artifact path of `target` unless another source publishes
    /// there.
    fn claim_artifact(&self, target: &Target) -> Option<InFlight<'_>> {
        let path = self.executor.artifact_path(target, Utc::now());
        if self
            .manifest
            .owner_of(&path)
            .is_some_and(|owner| owner != target.id())
        {
            return None;
        }
        InFlight::acquire(&self.in_flight, &format!("artifact:{}", path.display()))
    }

    fn run_job(&self, job: Job<'_>) -> TargetReport {
        let Job {
            request,
            target,
            claims: _claims,
            ..
        } = job;

        if let Some(report) = self.skip_if_unchanged(request, &target) {
            return report;
        }

        let finished = self
            .retry
            .execute_with_retry(target.id(), |number| self.executor.execute(&target, number));
        let (entry, error) = self.entry_for(&target, finished);
        self.finish(request, &target, entry, error)
    }

    /// Records an [ManifestOutcome::Unchanged] entry if the last backup of
    /// a file or directory target is still current.
    fn skip_if_unchanged(&self, request: &TargetRequest, target: &Target) -> Option<TargetReport> {
        if !self.skip_unchanged || self.cancel.is_cancelled() {
            return None;
        }
        let source = target.source_path()?;
        let started_at = Utc::now();
        let last = self.manifest.last_success(target.id())?;
        if last.artifact_path != self.executor.artifact_path(target, started_at)
            || !self.executor.verifier().is_unchanged(source, &last)
        {
            return None;
        }

        log::info!(target: "orchestrator", "{}: unchanged since {}", target.id(), last.timestamp);
        let entry = ManifestEntry {
            target_id: target.id().to_string(),
            timestamp: started_at,
            outcome: ManifestOutcome::Unchanged,
            checksum: last.checksum,
            artifact_path: last.artifact_path,
            size_bytes: last.size_bytes,
            attempts: 0,
        };
        Some(self.finish(request, target, entry, None))
    }

    /// Projects the terminal state of a target into its manifest entry.
    fn entry_for(&self, target: &Target, finished: Finished) -> (ManifestEntry, Option<BackupError>) {
        let outcome = match finished.outcome {
            TerminalOutcome::Success => ManifestOutcome::Success,
            TerminalOutcome::RetriesExhausted => ManifestOutcome::RetriesExhausted,
            TerminalOutcome::Fatal => ManifestOutcome::Fatal,
            TerminalOutcome::Cancelled => ManifestOutcome::Cancelled,
        };

        let Some(last) = finished.last else {
            let timestamp = Utc::now();
            let entry = ManifestEntry {
                target_id: target.id().to_string(),
                timestamp,
                outcome,
                checksum: String::new(),
                artifact_path: self.executor.artifact_path(target, timestamp),
                size_bytes: 0,
                attempts: finished.attempts,
            };
            return (entry, None);
        };

        let succeeded = outcome == ManifestOutcome::Success;
        let entry = ManifestEntry {
            target_id: target.id().to_string(),
            timestamp: last.started_at,
            outcome,
            checksum: match (&last.checksum, succeeded) {
                (Some(checksum), true) => checksum.to_string(),
                _ => String::new(),
            },
            artifact_path: last.artifact_path,
            size_bytes: if succeeded { last.bytes_written } else { 0 },
            attempts: finished.attempts,
        };
        let error = match last.outcome {
            AttemptOutcome::RetryableFailure(err) | AttemptOutcome::FatalFailure(err) => Some(err),
            AttemptOutcome::Success | AttemptOutcome::Cancelled => None,
        };
        (entry, error)
    }

    /// Records `entry` and runs the publish hooks on success.
    fn finish(
        &self,
        request: &TargetRequest,
        target: &Target,
        entry: ManifestEntry,
        error: Option<BackupError>,
    ) -> TargetReport {
        let mut report = TargetReport {
            request: request.to_string(),
            target_id: Some(target.id().to_string()),
            outcome: entry.outcome.into(),
            attempts: entry.attempts,
            error,
            entry: None,
        };

        if let Err(err) = self.manifest.record(entry.clone()) {
            log::error!(target: "orchestrator", "{}: recording {} failed: {err}", target.id(), entry.outcome);
            report.outcome = TargetOutcome::Fatal;
            report.error = Some(BackupError::StoreWriteFailure(err));
            return report;
        }

        if entry.outcome.is_success() {
            for hook in &self.hooks {
                if let Err(e) = hook.published(target, &entry) {
                    log::warn!(target: "orchestrator", "{}: publish hook failed: {e}", target.id());
                }
            }
        }

        report.entry = Some(entry);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(outcome: ManifestOutcome) -> ManifestEntry {
        ManifestEntry {
            target_id: "path:/a".into(),
            timestamp: Utc::now(),
            outcome,
            checksum: String::new(),
            artifact_path: PathBuf::from("/b/a.bak"),
            size_bytes: 0,
            attempts: 1,
        }
    }

    #[test]
    fn in_flight_claim_is_exclusive_until_dropped() {
        let registry = Mutex::default();
        let claim = InFlight::acquire(&registry, "path:/a").unwrap();
        assert!(InFlight::acquire(&registry, "path:/a").is_none());
        assert!(InFlight::acquire(&registry, "path:/b").is_some());

        drop(claim);
        assert!(InFlight::acquire(&registry, "path:/a").is_some());
    }

    #[test]
    fn report_summarises_failures() {
        let report = |outcome: ManifestOutcome| TargetReport {
            request: "/a".into(),
            target_id: Some("path:/a".into()),
            outcome: outcome.into(),
            attempts: 1,
            error: None,
            entry: Some(entry(outcome)),
        };
        let mut run = RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            targets: vec![
                report(ManifestOutcome::Success),
                report(ManifestOutcome::Unchanged),
            ],
        };
        assert!(run.all_succeeded());
        assert_eq!(run.failures().count(), 0);

        run.targets.push(report(ManifestOutcome::RetriesExhausted));
        assert!(!run.all_succeeded());
        assert_eq!(run.failures().count(), 1);
    }

    #[test]
    fn rejections_map_to_outcomes() {
        let request = TargetRequest::path("/nope");
        let report = TargetReport::rejected(
            &request,
            Some("path:/nope"),
            BackupError::AlreadyInProgress {
                target_id: "path:/nope".into(),
            },
        );
        assert_eq!(report.outcome, TargetOutcome::AlreadyInProgress);
        assert_eq!(report.outcome.to_string(), "already in progress");
        assert_eq!(report.attempts, 0);

        let report = TargetReport::rejected(&request, None, BackupError::EmptyArtifact);
        assert_eq!(report.outcome, TargetOutcome::Fatal);
    }
}
