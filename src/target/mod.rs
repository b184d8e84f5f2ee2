//! Resolution of backup requests into normalized [Target]s.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derive_more::{Display, Error};
use sha2::{Digest, Sha256};

use crate::config::DatabaseInstance;
use crate::credentials::CredentialProvider;
use crate::error::BackupError;

/// Alias used by `--db` when none is given.
pub const DEFAULT_DB_ALIAS: &str = "default";

/// Length of the hex key naming a target's staging directory.
const KEY_LEN: usize = 16;

/// What the caller asked to back up.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum TargetRequest {
    /// A file or directory.
    Path {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PathBuf>,
    },
    /// A configured database instance.
    Database {
        database: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PathBuf>,
    },
}

impl TargetRequest {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path {
            path: path.into(),
            destination: None,
        }
    }

    pub fn database(alias: &str) -> Self {
        Self::Database {
            database: alias.to_string(),
            destination: None,
        }
    }

    pub fn with_destination(self, dir: impl Into<PathBuf>) -> Self {
        let dir = Some(dir.into());
        match self {
            Self::Path { path, .. } => Self::Path {
                path,
                destination: dir,
            },
            Self::Database { database, .. } => Self::Database {
                database,
                destination: dir,
            },
        }
    }
}

impl fmt::Display for TargetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path { path, .. } => write!(f, "{}", path.display()),
            Self::Database { database, .. } => write!(f, "db:{database}"),
        }
    }
}

/// The thing being backed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    File { source: PathBuf },
    Directory { source: PathBuf },
    Database { alias: String, instance: DatabaseInstance },
}

/// A resolved, immutable backup target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    id: String,
    kind: TargetKind,
    name: OsString,
    destination: PathBuf,
}

impl Target {
    /// Identity of the underlying data. Two requests naming the same data
    /// through different paths share an id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    /// Directory the artifact is published into.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Real path of a file or directory source.
    pub fn source_path(&self) -> Option<&Path> {
        match &self.kind {
            TargetKind::File { source } | TargetKind::Directory { source } => Some(source),
            TargetKind::Database { .. } => None,
        }
    }

    pub fn database_alias(&self) -> Option<&str> {
        match &self.kind {
            TargetKind::Database { alias, .. } => Some(alias),
            _ => None,
        }
    }

    /// Base name used for artifacts.
    pub fn name(&self) -> &std::ffi::OsStr {
        &self.name
    }

    /// The same target with its key appended to the artifact base name.
    pub fn with_unique_name(mut self) -> Self {
        let key = self.key();
        self.name.push("-");
        self.name.push(key);
        self
    }

    /// Short stable key derived from the id, safe to use as a file name.
    pub fn key(&self) -> String {
        let digest = Sha256::digest(self.id.as_bytes());
        hex::encode(digest)[..KEY_LEN].to_string()
    }
}

#[derive(Debug, Display, Error)]
/// A request that can't be turned into a [Target].
pub enum InvalidTarget {
    #[display("`{}` does not exist: {source}", path.display())]
    NotFound { path: PathBuf, source: io::Error },
    #[display("`{}` is not readable: {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },
    #[display("`{}` is neither a file nor a directory", _0.display())]
    Unsupported(#[error(ignore)] PathBuf),
    #[display("`{}` has no file name", _0.display())]
    NoName(#[error(ignore)] PathBuf),
    #[display("destination `{}` lies inside the source", _0.display())]
    DestinationInsideSource(#[error(ignore)] PathBuf),
    #[display("no database configured under alias `{_0}`")]
    UnknownDatabase(#[error(ignore)] String),
}

/// Turns [TargetRequest]s into [Target]s. Performs read-only checks only.
#[derive(Clone)]
pub struct TargetResolver {
    databases: BTreeMap<String, DatabaseInstance>,
    default_destination: PathBuf,
    credentials: Arc<dyn CredentialProvider>,
}

impl TargetResolver {
    pub fn new(
        databases: BTreeMap<String, DatabaseInstance>,
        default_destination: PathBuf,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            databases,
            default_destination,
            credentials,
        }
    }

    pub fn resolve(&self, request: &TargetRequest) -> Result<Target, BackupError> {
        match request {
            TargetRequest::Path { path, destination } => {
                self.resolve_path(path, self.destination(destination.as_deref()))
            }
            TargetRequest::Database {
                database,
                destination,
            } => self.resolve_database(database, self.destination(destination.as_deref())),
        }
    }

    fn destination(&self, requested: Option<&Path>) -> PathBuf {
        requested
            .unwrap_or(self.default_destination.as_path())
            .to_path_buf()
    }

    fn resolve_path(&self, path: &Path, destination: PathBuf) -> Result<Target, BackupError> {
        let real = fs::canonicalize(path).map_err(|source| InvalidTarget::NotFound {
            path: path.to_path_buf(),
            source,
        })?;
        if real != path {
            log::trace!(target: "target", "Resolved {} to {}", path.display(), real.display());
        }

        let unreadable = |source| InvalidTarget::Unreadable {
            path: real.clone(),
            source,
        };
        let meta = fs::metadata(&real).map_err(unreadable)?;
        let kind = if meta.is_file() {
            File::open(&real).map_err(unreadable)?;
            TargetKind::File {
                source: real.clone(),
            }
        } else if meta.is_dir() {
            fs::read_dir(&real).map_err(unreadable)?;
            if let Ok(dest) = fs::canonicalize(&destination) {
                if dest.starts_with(&real) {
                    return Err(InvalidTarget::DestinationInsideSource(destination).into());
                }
            }
            TargetKind::Directory {
                source: real.clone(),
            }
        } else {
            return Err(InvalidTarget::Unsupported(real).into());
        };

        // prefer the name the caller used, so a backup of `current -> v3` is `current.bak`
        let name = path
            .file_name()
            .or_else(|| real.file_name())
            .ok_or_else(|| InvalidTarget::NoName(real.clone()))?
            .to_os_string();

        Ok(Target {
            id: format!("path:{}", real.display()),
            kind,
            name,
            destination,
        })
    }

    fn resolve_database(&self, alias: &str, destination: PathBuf) -> Result<Target, BackupError> {
        let instance = self
            .databases
            .get(alias)
            .ok_or_else(|| InvalidTarget::UnknownDatabase(alias.to_string()))?
            .clone();
        self.credentials.resolve(alias)?;

        Ok(Target {
            id: format!("db:{alias}"),
            kind: TargetKind::Database {
                alias: alias.to_string(),
                instance,
            },
            name: OsString::from(alias),
            destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialsUnavailable, Credentials, StaticCredentials};

    struct NoCredentials;

    impl CredentialProvider for NoCredentials {
        fn resolve(&self, alias: &str) -> Result<Credentials, CredentialsUnavailable> {
            Err(CredentialsUnavailable::new(alias, "locked"))
        }
    }

    fn resolver(dest: &Path, credentials: Arc<dyn CredentialProvider>) -> TargetResolver {
        let mut databases = BTreeMap::new();
        databases.insert(DEFAULT_DB_ALIAS.to_string(), DatabaseInstance::default());
        TargetResolver::new(databases, dest.to_path_buf(), credentials)
    }

    fn static_resolver(dest: &Path) -> TargetResolver {
        resolver(dest, Arc::new(StaticCredentials::new("root", "")))
    }

    #[test]
    fn resolves_file_and_directory() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let file = src.path().join("notes.txt");
        fs::write(&file, "hi").unwrap();
        let resolver = static_resolver(dest.path());

        let target = resolver.resolve(&TargetRequest::path(&file)).unwrap();
        assert!(matches!(target.kind(), TargetKind::File { .. }));
        assert_eq!(target.name(), "notes.txt");
        assert_eq!(target.destination(), dest.path());
        assert!(target.database_alias().is_none());

        let target = resolver.resolve(&TargetRequest::path(src.path())).unwrap();
        assert!(matches!(target.kind(), TargetKind::Directory { .. }));
        assert_eq!(target.source_path(), Some(fs::canonicalize(src.path()).unwrap().as_path()));
    }

    #[test]
    fn missing_path_is_invalid() {
        let dest = tempfile::tempdir().unwrap();
        let err = static_resolver(dest.path())
            .resolve(&TargetRequest::path(dest.path().join("nope")))
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::InvalidTarget(InvalidTarget::NotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_shares_identity_with_its_target() {
        let src = tempfile::tempdir().unwrap();
        let real = src.path().join("data");
        fs::create_dir(&real).unwrap();
        let link = src.path().join("current");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let resolver = static_resolver(dest.path());
        let via_link = resolver.resolve(&TargetRequest::path(&link)).unwrap();
        let direct = resolver.resolve(&TargetRequest::path(&real)).unwrap();

        assert_eq!(via_link.id(), direct.id());
        assert_eq!(via_link.key(), direct.key());
        assert_eq!(via_link.name(), "current");
    }

    #[test]
    fn destination_inside_source_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        let inner = src.path().join("backups");
        fs::create_dir(&inner).unwrap();

        let err = static_resolver(&inner)
            .resolve(&TargetRequest::path(src.path()))
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::InvalidTarget(InvalidTarget::DestinationInsideSource(_))
        ));
    }

    #[test]
    fn request_destination_overrides_default() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let file = src.path().join("a");
        fs::write(&file, "x").unwrap();

        let target = static_resolver(dest.path())
            .resolve(&TargetRequest::path(&file).with_destination("/srv/other"))
            .unwrap();
        assert_eq!(target.destination(), Path::new("/srv/other"));
    }

    #[test]
    fn resolves_database_aliases() {
        let dest = tempfile::tempdir().unwrap();
        let target = static_resolver(dest.path())
            .resolve(&TargetRequest::database(DEFAULT_DB_ALIAS))
            .unwrap();

        assert_eq!(target.id(), "db:default");
        assert_eq!(target.database_alias(), Some(DEFAULT_DB_ALIAS));
        assert_eq!(target.key().len(), KEY_LEN);

        let err = static_resolver(dest.path())
            .resolve(&TargetRequest::database("missing"))
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::InvalidTarget(InvalidTarget::UnknownDatabase(_))
        ));
    }

    #[test]
    fn database_without_credentials_is_rejected() {
        let dest = tempfile::tempdir().unwrap();
        let err = resolver(dest.path(), Arc::new(NoCredentials))
            .resolve(&TargetRequest::database(DEFAULT_DB_ALIAS))
            .unwrap_err();

        assert!(matches!(err, BackupError::CredentialsUnavailable(_)));
    }

    #[test]
    fn request_labels() {
        assert_eq!(TargetRequest::database("shop").to_string(), "db:shop");
        assert_eq!(TargetRequest::path("/etc/hosts").to_string(), "/etc/hosts");
    }
}
