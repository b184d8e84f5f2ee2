//! Configuration of a backup run, usually read from `backup.toml`.
//!
//! Every field has a default so the file is optional. The configuration is
//! passed explicitly into [BackupOrchestrator](crate::orchestrator::BackupOrchestrator);
//! nothing is read from global state.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::backends::mariadb::DumpOptions;
use crate::cancel::CancelPolicy;
use crate::retry::RetryPolicy;
use crate::target::TargetRequest;
use crate::verify::IntegrityPolicy;

const DEFAULT_MANIFEST: &str = "backup-manifest.jsonl";
const DEFAULT_STAGING: &str = ".backup-staging";
const DEFAULT_PASSWORD_ENV: &str = "BACKUP_DB_PASSWORD";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Root configuration object.
pub struct BackupConfig {
    /// Directory artifacts are published into unless a request names its own.
    ///
    /// When unset the caller has to supply one via [with_destination](Self::with_destination).
    pub destination: Option<PathBuf>,

    /// Manifest file. Relative paths are taken relative to [destination](Self::destination).
    pub manifest: PathBuf,

    /// Name of the staging directory created inside each destination.
    ///
    /// Staging lives next to the artifacts so publishing is a same-filesystem rename.
    pub staging_dir_name: String,

    /// Number of targets backed up concurrently.
    pub parallelism: usize,

    /// Upper bound on the duration of a single attempt.
    pub attempt_timeout_secs: u64,

    /// Treatment of running subprocesses on cancellation.
    pub cancel_policy: CancelPolicy,

    /// Skip file and directory targets whose source did not change since
    /// the last successful backup.
    pub skip_unchanged: bool,

    /// Require a copied artifact to hash identically to its source.
    pub verify_against_source: bool,

    pub retry: RetryPolicy,

    pub integrity: IntegrityPolicy,

    pub dump: DumpOptions,

    /// Database instances addressable by alias.
    pub databases: BTreeMap<String, DatabaseInstance>,

    /// Requests run when no target is given on the command line.
    pub targets: Vec<TargetRequest>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let mut databases = BTreeMap::new();
        databases.insert(
            crate::target::DEFAULT_DB_ALIAS.to_string(),
            DatabaseInstance::default(),
        );

        Self {
            destination: None,
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            staging_dir_name: DEFAULT_STAGING.to_string(),
            parallelism: 4,
            attempt_timeout_secs: 3600,
            cancel_policy: CancelPolicy::default(),
            skip_unchanged: true,
            verify_against_source: true,
            retry: RetryPolicy::default(),
            integrity: IntegrityPolicy::default(),
            dump: DumpOptions::default(),
            databases,
            targets: Vec::new(),
        }
    }
}

impl BackupConfig {
    /// Sets the default destination if the configuration doesn't name one.
    pub fn with_destination(mut self, fallback: &Path) -> Self {
        if self.destination.is_none() {
            self.destination = Some(fallback.to_path_buf());
        }
        self
    }

    /// Default destination; `.` if none was configured.
    pub fn destination(&self) -> &Path {
        self.destination.as_deref().unwrap_or(Path::new("."))
    }

    pub fn manifest_path(&self) -> PathBuf {
        if self.manifest.is_absolute() {
            self.manifest.clone()
        } else {
            self.destination().join(&self.manifest)
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }

    /// Reads the configuration at `path`.
    ///
    /// Returns [None] if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::Read(e)),
        };
        let config = toml::from_slice(&raw)?;
        Ok(Some(config))
    }

    /// Reads the configuration at `path`, writing the default configuration
    /// there first if the file doesn't exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if let Some(config) = Self::load(path)? {
            return Ok(config);
        }

        log::debug!(
            "Writing default config to {} because it doesn't exist yet",
            path.display()
        );
        let default_config = Self::default();
        let config_str = toml::to_string_pretty(&default_config)?;
        if let Err(e) = std::fs::write(path, config_str) {
            log::warn!("Writing default config to {} failed {e}", path.display());
        }

        Ok(default_config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Connection details of a database server reachable under an alias.
pub struct DatabaseInstance {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Login user. May be overridden on the command line.
    pub user: Option<String>,
    /// Environment variable holding the password.
    pub password_env: String,
    /// Databases to dump; empty means all of them.
    pub databases: Vec<String>,
}

impl Default for DatabaseInstance {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            user: None,
            password_env: DEFAULT_PASSWORD_ENV.to_string(),
            databases: Vec::new(),
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors loading or storing a [BackupConfig].
pub enum ConfigError {
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    #[from]
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
    #[from]
    #[display("Serializing the config failed: {_0}")]
    Serialize(toml::ser::Error),
}
