//! Consistent dumps of MySQL/MariaDB instances.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::DatabaseInstance;
use crate::credentials::Credentials;
use crate::error::BackupError;
use crate::runner::CommandRequest;
use crate::target::{InvalidTarget, Target, TargetKind};
use crate::verify::{Expected, IntegrityError, IntegrityPolicy};

use super::{Backup, ExecutionContext, Staged, Staging};

const OPTION_FILE: &str = "client.cnf";
const DUMP_FILE: &str = "dump.sql";
const COMPRESSED_DUMP_FILE: &str = "dump.sql.gz";
/// Last line `mysqldump` writes once a dump is complete.
const DUMP_TRAILER: &[u8] = b"-- Dump completed";
const TRAILER_WINDOW: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// How dumps are taken.
pub struct DumpOptions {
    /// Dump program, `mysqldump` or `mariadb-dump`.
    pub command: String,
    pub include_routines: bool,
    pub include_events: bool,
    pub include_triggers: bool,
    /// Gzip the dump after it was validated.
    pub compress: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            command: "mysqldump".to_string(),
            include_routines: true,
            include_events: true,
            include_triggers: true,
            compress: false,
        }
    }
}

impl DumpOptions {
    pub fn flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.include_routines {
            flags.push("--routines");
        }
        if self.include_events {
            flags.push("--events");
        }
        flags.push(if self.include_triggers {
            "--triggers"
        } else {
            "--skip-triggers"
        });
        flags
    }
}

/// The [MariaDb] backend dumps every database of an instance (or a
/// configured subset) in a single transaction.
#[derive(Debug, Clone)]
pub struct MariaDb {
    options: DumpOptions,
    policy: IntegrityPolicy,
}

impl MariaDb {
    pub fn new(options: DumpOptions, policy: IntegrityPolicy) -> Self {
        Self { options, policy }
    }

    /// `<alias>-<UTC timestamp>.sql[.gz]`
    pub fn dump_name(&self, alias: &str, started_at: DateTime<Utc>) -> String {
        let timestamp = started_at.format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let ext = if self.options.compress { "sql.gz" } else { "sql" };
        format!("{alias}-{timestamp}.{ext}")
    }

    /// Command line dumping `instance` into `result_file`.
    ///
    /// The login is read from `option_file` so the password never shows up
    /// in the process list.
    pub fn request(
        &self,
        instance: &DatabaseInstance,
        option_file: &Path,
        result_file: &Path,
        ctx: &ExecutionContext<'_>,
    ) -> CommandRequest {
        // must be the very first argument
        let mut defaults = OsString::from("--defaults-extra-file=");
        defaults.push(option_file);
        let mut result = OsString::from("--result-file=");
        result.push(result_file);

        let mut request = CommandRequest::new(&self.options.command, ctx.timeout)
            .arg(defaults)
            .arg("--single-transaction")
            .args(self.options.flags());
        if let Some(host) = &instance.host {
            request = request.arg(format!("--host={host}"));
        }
        if let Some(port) = instance.port {
            request = request.arg(format!("--port={port}"));
        }
        request = request.arg(result);
        if instance.databases.is_empty() {
            request = request.arg("--all-databases");
        } else {
            request = request.arg("--databases").args(&instance.databases);
        }
        request.cancel_with(ctx.cancel.clone())
    }

    /// Dumps `instance` into `staging`.
    pub fn dump(
        &self,
        alias: &str,
        instance: &DatabaseInstance,
        staging: &Staging,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Staged, BackupError> {
        let credentials = ctx.credentials.resolve(alias)?;
        log::info!(target: "backend::mariadb", "Dumping database instance `{alias}`");
        log::trace!(target: "backend::mariadb", "Using user '{}' for `{alias}`", credentials.user);

        let option_file = staging.path(OPTION_FILE);
        write_option_file(&option_file, &credentials)?;

        let dump = staging.path(DUMP_FILE);
        let request = self.request(instance, &option_file, &dump, ctx);
        log::debug!(target: "backend::mariadb", "Running {}", request.display());
        let output = ctx.runner.run(&request);
        if let Err(e) = fs::remove_file(&option_file) {
            log::warn!(target: "backend::mariadb", "Removing {} failed: {e}", option_file.display());
        }
        let output = output?;
        if !output.success() {
            return Err(BackupError::execution_failed(output.exit_code, &output.stderr));
        }

        let size = match fs::metadata(&dump) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size == 0 {
            log::warn!(target: "backend::mariadb", "{} succeeded but wrote no dump", self.options.command);
            return Err(BackupError::EmptyArtifact);
        }
        if self.policy.require_dump_trailer && !has_trailer(&dump)? {
            return Err(IntegrityError::Truncated.into());
        }

        if !self.options.compress {
            return Ok(Staged {
                path: dump,
                exit_status: output.exit_code,
                expected: Expected {
                    min_size: self.policy.min_dump_size,
                    checksum: None,
                },
            });
        }

        // size bounds only make sense for the raw dump
        if size < self.policy.min_dump_size {
            return Err(IntegrityError::TooSmall {
                size,
                minimum: self.policy.min_dump_size,
            }
            .into());
        }
        let compressed = staging.path(COMPRESSED_DUMP_FILE);
        compress(&dump, &compressed)?;
        fs::remove_file(&dump)?;
        log::debug!(target: "backend::mariadb", "Compressed dump of `{alias}`");

        Ok(Staged {
            path: compressed,
            exit_status: output.exit_code,
            expected: Expected {
                min_size: 1,
                checksum: None,
            },
        })
    }
}

impl Backup for MariaDb {
    fn artifact_name(&self, target: &Target, started_at: DateTime<Utc>) -> OsString {
        let alias = target.database_alias().unwrap_or("database");
        self.dump_name(alias, started_at).into()
    }

    fn stage(
        &self,
        target: &Target,
        staging: &Staging,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Staged, BackupError> {
        let TargetKind::Database { alias, instance } = target.kind() else {
            return Err(InvalidTarget::Unsupported(target.id().into()).into());
        };
        self.dump(alias, instance, staging, ctx)
    }
}

/// Quotes `value` for a MySQL option file.
fn option_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn write_option_file(path: &Path, credentials: &Credentials) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    writeln!(file, "[client]")?;
    writeln!(file, "user={}", option_value(&credentials.user))?;
    if !credentials.auth_token.is_empty() {
        writeln!(file, "password={}", option_value(&credentials.auth_token))?;
    }
    file.sync_all()
}

fn has_trailer(dump: &Path) -> io::Result<bool> {
    let mut file = File::open(dump)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TRAILER_WINDOW)))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;
    Ok(tail
        .windows(DUMP_TRAILER.len())
        .any(|window| window == DUMP_TRAILER))
}

fn compress(raw: &Path, compressed: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(raw)?);
    let file = File::create_new(compressed)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.sync_all()
}
