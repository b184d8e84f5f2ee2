//! Copies files and directory trees with `cp -a`.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::BackupError;
use crate::runner::CommandRequest;
use crate::target::{InvalidTarget, Target};
use crate::verify::{self, Expected};

use super::{Backup, ExecutionContext, Staged, Staging};

const CP: &str = "cp";
const STAGED_NAME: &str = "artifact";
const SUFFIX: &str = ".bak";

/// The [FileCopy] backend copies a file or directory preserving mode,
/// ownership, timestamps and links.
#[derive(Debug, Clone)]
pub struct FileCopy {
    verify_against_source: bool,
    min_size: u64,
}

impl FileCopy {
    pub fn new(verify_against_source: bool, min_size: u64) -> Self {
        Self {
            verify_against_source,
            min_size,
        }
    }

    /// `<name>.bak`
    pub fn copy_name(name: &OsStr) -> OsString {
        let mut artifact = name.to_os_string();
        artifact.push(SUFFIX);
        artifact
    }

    pub fn request(source: &Path, staged: &Path, ctx: &ExecutionContext<'_>) -> CommandRequest {
        CommandRequest::new(CP, ctx.timeout)
            .arg("-a")
            .arg("--")
            .arg(source)
            .arg(staged)
            .cancel_with(ctx.cancel.clone())
    }

    /// Copies `source` into `staging`.
    pub fn copy(
        &self,
        source: &Path,
        staging: &Staging,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Staged, BackupError> {
        let staged = staging.path(STAGED_NAME);
        log::debug!(target: "backend::copy", "Copy {} to {}", source.display(), staged.display());

        let output = ctx.runner.run(&Self::request(source, &staged, ctx))?;
        if !output.success() {
            return Err(BackupError::execution_failed(output.exit_code, &output.stderr));
        }

        if fs::symlink_metadata(&staged).is_err() {
            log::warn!(target: "backend::copy", "{CP} succeeded but produced nothing");
            return Err(BackupError::EmptyArtifact);
        }
        if verify::is_empty(&staged)? && !verify::is_empty(source)? {
            return Err(BackupError::EmptyArtifact);
        }

        let checksum = if self.verify_against_source {
            Some(verify::checksum(source)?.checksum)
        } else {
            None
        };

        Ok(Staged {
            path: staged,
            exit_status: output.exit_code,
            expected: Expected {
                min_size: self.min_size,
                checksum,
            },
        })
    }
}

impl Backup for FileCopy {
    fn artifact_name(&self, target: &Target, _started_at: DateTime<Utc>) -> OsString {
        Self::copy_name(target.name())
    }

    fn stage(
        &self,
        target: &Target,
        staging: &Staging,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Staged, BackupError> {
        let source = target
            .source_path()
            .ok_or_else(|| InvalidTarget::Unsupported(target.id().into()))?;
        self.copy(source, staging, ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::runner::{CommandOutput, CommandRunner, RunnerError};

    /// Writes `content` to the destination argument instead of copying.
    struct FakeCp {
        content: Option<&'static str>,
        exit_code: i32,
        seen: Mutex<Vec<String>>,
    }

    impl CommandRunner for FakeCp {
        fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RunnerError> {
            self.seen.lock().unwrap().push(request.display());
            if let (Some(content), Some(dest)) = (self.content, request.argv.last()) {
                fs::write(dest, content)?;
            }
            Ok(CommandOutput {
                exit_code: Some(self.exit_code),
                stdout: Vec::new(),
                stderr: b"cp: cannot stat: Permission denied".to_vec(),
            })
        }
    }

    fn fake(content: Option<&'static str>, exit_code: i32) -> FakeCp {
        FakeCp {
            content,
            exit_code,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn stage_with(runner: &FakeCp, source: &Path, staging_root: &Path) -> Result<Staged, BackupError> {
        let credentials = StaticCredentials::new("u", "");
        let ctx = ExecutionContext {
            runner,
            credentials: &credentials,
            timeout: Duration::from_secs(5),
            cancel: None,
        };
        let staging = Staging::prepare(staging_root.join("stage")).unwrap();
        FileCopy::new(true, 0).copy(source, &staging, &ctx)
    }

    #[test]
    fn copy_name_appends_suffix() {
        assert_eq!(FileCopy::copy_name(OsStr::new("app")), "app.bak");
        assert_eq!(FileCopy::copy_name(OsStr::new("notes.txt")), "notes.txt.bak");
    }

    #[test]
    fn stages_and_expects_source_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        fs::write(&source, "same").unwrap();

        let runner = fake(Some("same"), 0);
        let staged = stage_with(&runner, &source, dir.path()).unwrap();

        assert_eq!(
            staged.expected.checksum,
            Some(verify::checksum(&source).unwrap().checksum)
        );
        let argv = runner.seen.lock().unwrap()[0].clone();
        assert!(argv.starts_with("cp -a -- "));
    }

    #[test]
    fn nonzero_exit_is_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        fs::write(&source, "data").unwrap();

        let err = stage_with(&fake(None, 1), &source, dir.path()).unwrap_err();
        assert!(matches!(err, BackupError::ExecutionFailed { exit_code: 1, .. }));
    }

    #[test]
    fn empty_copy_of_nonempty_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        fs::write(&source, "data").unwrap();

        let err = stage_with(&fake(Some(""), 0), &source, dir.path()).unwrap_err();
        assert!(matches!(err, BackupError::EmptyArtifact));

        let err = stage_with(&fake(None, 0), &source, dir.path()).unwrap_err();
        assert!(matches!(err, BackupError::EmptyArtifact));
    }

    #[test]
    fn empty_source_may_produce_empty_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.txt");
        fs::write(&source, "").unwrap();

        assert!(stage_with(&fake(Some(""), 0), &source, dir.path()).is_ok());
    }
}
