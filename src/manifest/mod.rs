//! Durable, append-only record of backup runs.
//!
//! The manifest is a JSON Lines file: one [ManifestEntry] per line, never
//! rewritten. All writes go through a single mutex-guarded handle, so records
//! from concurrently finishing targets never interleave. Each record is
//! flushed to disk before [ManifestStore::record] returns. Reads and writes
//! hold an exclusive advisory lock on the file, which keeps other processes
//! sharing the manifest from seeing or repairing a half-written record.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
/// Terminal outcome of a target's run as persisted in the manifest.
pub enum ManifestOutcome {
    #[display("success")]
    Success,
    /// The source was unchanged; the previous artifact was kept.
    #[display("unchanged")]
    Unchanged,
    #[display("retries exhausted")]
    RetriesExhausted,
    #[display("fatal")]
    Fatal,
    #[display("cancelled")]
    Cancelled,
}

impl ManifestOutcome {
    /// Whether the entry refers to a valid artifact.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
/// One manifest record. Never mutated after it was written.
pub struct ManifestEntry {
    pub target_id: String,
    /// Start of the run the entry describes.
    pub timestamp: DateTime<Utc>,
    pub outcome: ManifestOutcome,
    /// Hex SHA-256 of the artifact; empty for failed runs.
    pub checksum: String,
    pub artifact_path: PathBuf,
    pub size_bytes: u64,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Display, Error, From)]
pub enum StoreError {
    #[from]
    #[display("Manifest I/O failed: {_0}")]
    Io(io::Error),
    #[from]
    #[display("Encoding manifest entry failed: {_0}")]
    Encode(serde_json::Error),
}

struct Inner {
    file: File,
    entries: Vec<ManifestEntry>,
    /// Index into `entries` of the latest successful entry per target.
    last_success: HashMap<String, usize>,
}

impl Inner {
    fn index(&mut self, entry: ManifestEntry) {
        if entry.outcome.is_success() {
            self.last_success
                .insert(entry.target_id.clone(), self.entries.len());
        }
        self.entries.push(entry);
    }
}

pub struct ManifestStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ManifestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ManifestStore {
    /// Opens the manifest at `path`, creating it if necessary, and replays
    /// its history.
    ///
    /// A torn trailing record left by an interrupted write is cut off.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let created = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        if created {
            sync_parent(path);
        }

        file.lock()?;
        let raw = read_complete(&mut file, path);
        file.unlock()?;
        let raw = raw?;

        let mut inner = Inner {
            file,
            entries: Vec::new(),
            last_success: HashMap::new(),
        };
        for (lineno, line) in raw.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<ManifestEntry>(line) {
                Ok(entry) => inner.index(entry),
                Err(e) => {
                    log::warn!(target: "manifest", "Skipping unreadable record {}:{}: {e}", path.display(), lineno + 1)
                }
            }
        }
        log::debug!(target: "manifest", "Loaded {} records from {}", inner.entries.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `entry` and flushes it to disk.
    ///
    /// On failure the file is cut back to its previous length so no partial
    /// record becomes visible.
    pub fn record(&self, entry: ManifestEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.file.lock()?;
        let written = append(&mut inner.file, &self.path, &line);
        if let Err(e) = inner.file.unlock() {
            log::warn!(target: "manifest", "Unlocking {} failed: {e}", self.path.display());
        }
        if let Err(e) = written {
            log::error!(target: "manifest", "Writing record for {} failed: {e}", entry.target_id);
            return Err(e.into());
        }

        log::trace!(target: "manifest", "Recorded {} for {}", entry.outcome, entry.target_id);
        inner.index(entry);
        Ok(())
    }

    /// Target that last recorded a run publishing to `artifact_path`.
    pub fn owner_of(&self, artifact_path: &Path) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .iter()
            .rev()
            .find(|e| e.artifact_path == artifact_path)
            .map(|e| e.target_id.clone())
    }

    /// Latest entry for `target_id` that refers to a valid artifact.
    pub fn last_success(&self, target_id: &str) -> Option<ManifestEntry> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .last_success
            .get(target_id)
            .map(|&i| inner.entries[i].clone())
    }

    /// Every entry for `target_id`, oldest first.
    pub fn history(&self, target_id: &str) -> Vec<ManifestEntry> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .iter()
            .filter(|e| e.target_id == target_id)
            .cloned()
            .collect()
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Vec<ManifestEntry> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clone()
    }
}

/// Reads every complete record, cutting off a torn trailing one. Expects the
/// file lock to be held.
fn read_complete(file: &mut File, path: &Path) -> io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut raw)?;

    let complete = raw.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    if complete < raw.len() {
        log::warn!(target: "manifest", "Discarding torn record at the end of {}", path.display());
        file.set_len(complete as u64)?;
        file.sync_data()?;
        raw.truncate(complete);
    }
    Ok(raw)
}

/// Appends `line` behind the last complete record and syncs it. Expects the
/// file lock to be held; rolls back on failure.
fn append(file: &mut File, path: &Path, line: &[u8]) -> io::Result<()> {
    let mut len = file.metadata()?.len();
    if len > 0 {
        let mut last = [0; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            len = read_complete(file, path)?.len() as u64;
        }
    }

    let written = file.write_all(line).and_then(|()| file.sync_data());
    if written.is_err() {
        if let Err(e) = file.set_len(len) {
            log::error!(target: "manifest", "Rolling back {} failed: {e}", path.display());
        }
    }
    written
}

/// Makes the creation of `path` itself durable.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = File::open(parent).and_then(|d| d.sync_all()) {
            log::debug!(target: "manifest", "Syncing {} failed: {e}", parent.display());
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
