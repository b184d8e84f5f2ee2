//! Integrity checks of produced artifacts.
//!
//! Checksums are SHA-256, computed by streaming so arbitrarily large artifacts
//! never have to fit into memory. A regular file hashes to its plain content
//! digest (the same value `sha256sum` prints). A directory hashes a canonical
//! walk of its tree, which makes a faithful copy hash identically to its
//! source.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::{Duration, SystemTime};

use derive_more::{Display, Error, From};
use sha2::{Digest, Sha256};

use crate::manifest::ManifestEntry;

const BUF_SIZE: usize = 64 * 1024;
/// Coarsest modification time resolution in use (FAT keeps two seconds).
const MTIME_GRANULARITY: Duration = Duration::from_secs(2);

/// Hex encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum(String);

impl Checksum {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Thresholds an artifact has to meet.
pub struct IntegrityPolicy {
    /// Minimum plausible size of a copied file or directory, in bytes.
    pub min_file_size: u64,
    /// Minimum plausible size of a database dump, in bytes.
    ///
    /// Even a dump of an empty server carries a header well beyond this.
    pub min_dump_size: u64,
    /// Require the completion trailer `mysqldump` writes as its last line.
    pub require_dump_trailer: bool,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        Self {
            min_file_size: 0,
            min_dump_size: 64,
            require_dump_trailer: true,
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// An artifact failed verification.
pub enum IntegrityError {
    #[display("Artifact is {size} bytes, below the plausible minimum of {minimum} bytes")]
    TooSmall { size: u64, minimum: u64 },
    #[display("Checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
    #[display("Dump is truncated: completion trailer missing")]
    Truncated,
    #[from]
    #[display("Reading the artifact failed: {_0}")]
    Read(io::Error),
}

/// What a verified artifact is expected to satisfy.
#[derive(Debug, Clone, Default)]
pub struct Expected {
    pub min_size: u64,
    pub checksum: Option<Checksum>,
}

/// Checksum and size of a verified artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub checksum: Checksum,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityVerifier {
    policy: IntegrityPolicy,
}

impl IntegrityVerifier {
    pub fn new(policy: IntegrityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &IntegrityPolicy {
        &self.policy
    }

    /// Hashes `artifact` and checks it against `expected`.
    pub fn verify(&self, artifact: &Path, expected: &Expected) -> Result<Verified, IntegrityError> {
        let verified = checksum(artifact)?;
        log::trace!(target: "verify", "{}: {} ({} bytes)", artifact.display(), verified.checksum, verified.size);

        if verified.size < expected.min_size {
            return Err(IntegrityError::TooSmall {
                size: verified.size,
                minimum: expected.min_size,
            });
        }
        if let Some(want) = &expected.checksum {
            if *want != verified.checksum {
                return Err(IntegrityError::Mismatch {
                    expected: want.to_string(),
                    actual: verified.checksum.to_string(),
                });
            }
        }

        Ok(verified)
    }

    /// Whether `source` can be skipped because `last` still holds an
    /// identical backup of it.
    ///
    /// True only if the recorded artifact still hashes to the recorded
    /// checksum and nothing below `source` was modified after the recorded
    /// run started. Modifications within one timestamp tick of the start
    /// count as later.
    pub fn is_unchanged(&self, source: &Path, last: &ManifestEntry) -> bool {
        let since = SystemTime::from(last.timestamp)
            .checked_sub(MTIME_GRANULARITY)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        match latest_modification(source) {
            Ok(modified) if modified < since => {}
            Ok(_) => return false,
            Err(e) => {
                log::debug!(target: "verify", "Can't stat {}: {e}", source.display());
                return false;
            }
        }

        match checksum(&last.artifact_path) {
            Ok(current) => current.checksum.as_str() == last.checksum,
            Err(_) => false,
        }
    }
}

/// Streaming checksum of a file or directory tree.
pub fn checksum(path: &Path) -> io::Result<Verified> {
    let meta = fs::metadata(path)?;
    let mut hasher = Sha256::new();
    let size = if meta.is_dir() {
        hash_tree(path, Path::new(""), &mut hasher)?
    } else {
        hash_file(path, &mut hasher)?
    };

    Ok(Verified {
        checksum: Checksum(hex::encode(hasher.finalize())),
        size,
    })
}

fn hash_file(path: &Path, hasher: &mut Sha256) -> io::Result<u64> {
    let mut reader = BufReader::with_capacity(BUF_SIZE, File::open(path)?);
    let mut buf = vec![0; BUF_SIZE];
    let mut total = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

fn hash_name(hasher: &mut Sha256, tag: &[u8], name: &Path) {
    let bytes = name.as_os_str().as_encoded_bytes();
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Hashes the tree below `root.join(rel)` in sorted order and returns the
/// total size of its regular files.
fn hash_tree(root: &Path, rel: &Path, hasher: &mut Sha256) -> io::Result<u64> {
    let mut entries = fs::read_dir(root.join(rel))?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut total = 0;
    for entry in entries {
        let rel_path = rel.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            hash_name(hasher, b"L", &rel_path);
            hash_name(hasher, b">", &fs::read_link(entry.path())?);
        } else if file_type.is_dir() {
            hash_name(hasher, b"D", &rel_path);
            total += hash_tree(root, &rel_path, hasher)?;
        } else if file_type.is_file() {
            hash_name(hasher, b"F", &rel_path);
            hasher.update(entry.metadata()?.len().to_le_bytes());
            total += hash_file(&entry.path(), hasher)?;
        }
    }
    Ok(total)
}

/// Latest modification time of `path` or anything below it.
fn latest_modification(path: &Path) -> io::Result<SystemTime> {
    let meta = fs::symlink_metadata(path)?;
    let mut latest = meta.modified()?;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            latest = latest.max(latest_modification(&entry?.path())?);
        }
    }
    Ok(latest)
}

/// Whether a directory has no entries or a file has no content.
pub(crate) fn is_empty(path: &Path) -> io::Result<bool> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        Ok(fs::read_dir(path)?.next().is_none())
    } else {
        Ok(meta.len() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestOutcome;
    use chrono::{Duration as ChronoDuration, Utc};

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        fs::write(root.join("sub/b.txt"), "bravo").unwrap();
        fs::write(root.join("sub/deeper/c.txt"), "charlie").unwrap();
    }

    #[test]
    fn file_checksum_is_plain_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "abc").unwrap();

        let verified = checksum(&file).unwrap();
        assert_eq!(
            verified.checksum.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(verified.size, 3);
    }

    #[test]
    fn identical_trees_hash_identically() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        sample_tree(a.path());
        sample_tree(b.path());

        let left = checksum(a.path()).unwrap();
        let right = checksum(b.path()).unwrap();
        assert_eq!(left, right);
        assert_eq!(left.size, 17);

        fs::write(b.path().join("sub/b.txt"), "bravO").unwrap();
        assert_ne!(checksum(b.path()).unwrap().checksum, left.checksum);
    }

    #[test]
    fn renaming_a_file_changes_the_tree_checksum() {
        let a = tempfile::tempdir().unwrap();
        sample_tree(a.path());
        let before = checksum(a.path()).unwrap();

        fs::rename(a.path().join("a.txt"), a.path().join("z.txt")).unwrap();
        assert_ne!(checksum(a.path()).unwrap().checksum, before.checksum);
    }

    #[test]
    fn verify_enforces_minimum_size_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("dump.sql");
        fs::write(&file, "short").unwrap();
        let verifier = IntegrityVerifier::default();

        let err = verifier
            .verify(&file, &Expected { min_size: 64, checksum: None })
            .unwrap_err();
        assert!(matches!(err, IntegrityError::TooSmall { size: 5, minimum: 64 }));

        let err = verifier
            .verify(
                &file,
                &Expected {
                    min_size: 0,
                    checksum: Some(Checksum::from_hex("00")),
                },
            )
            .unwrap_err();
        assert!(matches!(err, IntegrityError::Mismatch { .. }));

        let ok = verifier.verify(&file, &Expected::default()).unwrap();
        assert_eq!(ok.size, 5);
    }

    #[test]
    fn detects_unchanged_sources() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        let artifact = dir.path().join("src.txt.bak");
        fs::write(&source, "payload").unwrap();
        fs::copy(&source, &artifact).unwrap();
        let sum = checksum(&artifact).unwrap();

        let mut entry = ManifestEntry {
            target_id: "t".into(),
            timestamp: Utc::now() + ChronoDuration::seconds(5),
            outcome: ManifestOutcome::Success,
            checksum: sum.checksum.to_string(),
            artifact_path: artifact.clone(),
            size_bytes: sum.size,
            attempts: 1,
        };
        let verifier = IntegrityVerifier::default();
        assert!(verifier.is_unchanged(&source, &entry));

        // source modified after the recorded run started
        entry.timestamp = Utc::now() - ChronoDuration::hours(1);
        assert!(!verifier.is_unchanged(&source, &entry));

        // artifact tampered with
        entry.timestamp = Utc::now() + ChronoDuration::seconds(5);
        fs::write(&artifact, "garbage").unwrap();
        assert!(!verifier.is_unchanged(&source, &entry));

        // artifact gone
        fs::remove_file(&artifact).unwrap();
        assert!(!verifier.is_unchanged(&source, &entry));
    }

    #[test]
    fn writes_in_the_same_mtime_tick_as_the_run_are_changes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        let artifact = dir.path().join("src.txt.bak");
        fs::write(&source, "payload").unwrap();
        fs::copy(&source, &artifact).unwrap();
        let sum = checksum(&artifact).unwrap();

        // a write just after the run started, stored with whole-second precision
        let run_started = Utc::now();
        let coarse = run_started.timestamp() as u64;
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(coarse))
            .unwrap();

        let entry = ManifestEntry {
            target_id: "t".into(),
            timestamp: run_started,
            outcome: ManifestOutcome::Success,
            checksum: sum.checksum.to_string(),
            artifact_path: artifact,
            size_bytes: sum.size,
            attempts: 1,
        };
        assert!(!IntegrityVerifier::default().is_unchanged(&source, &entry));
    }

    #[test]
    fn emptiness() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_empty(dir.path()).unwrap());
        let file = dir.path().join("f");
        fs::write(&file, "").unwrap();
        assert!(is_empty(&file).unwrap());
        assert!(!is_empty(dir.path()).unwrap());
    }
}
