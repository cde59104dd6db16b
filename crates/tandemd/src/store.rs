//! Durable snapshot of the waiting queue and session directory.
//!
//! The snapshot is a single JSON document rewritten on every mutation:
//!
//! ```json
//! { "queue": [3, 9], "sessions": { "1": 2, "2": 1 } }
//! ```
//!
//! Writes go to a sibling temp file that is then renamed over the snapshot,
//! so a crash leaves either the previous or the new snapshot on disk.

use crate::error::TandemError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tandem_common::ParticipantId;
use tracing::{debug, warn};

/// Serialized form of the registry state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Waiting participants, head first.
    #[serde(default)]
    pub queue: Vec<ParticipantId>,
    /// Symmetric partner map.
    #[serde(default)]
    pub sessions: BTreeMap<ParticipantId, ParticipantId>,
}

/// Problems fixed by [`Snapshot::sanitize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Repairs {
    /// Session entries dropped for being self-paired or one-sided.
    pub broken_pairs: usize,
    /// Queue entries dropped as duplicates.
    pub duplicate_waiters: usize,
    /// Queue entries dropped because the participant is also paired.
    pub paired_waiters: usize,
}

impl Repairs {
    /// Returns `true` if nothing had to be fixed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        *self == Repairs::default()
    }
}

impl Snapshot {
    /// Returns `true` if nobody is waiting or paired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.sessions.is_empty()
    }

    /// Enforce queue/session invariants on externally sourced data.
    ///
    /// Keeps only mutual, non-self pairs; then keeps the first occurrence of
    /// each queued id that is not paired.
    pub fn sanitize(&mut self) -> Repairs {
        let mut repairs = Repairs::default();

        let before = self.sessions.len();
        let original = std::mem::take(&mut self.sessions);
        self.sessions = original
            .iter()
            .filter(|&(a, b)| a != b && original.get(b) == Some(a))
            .map(|(a, b)| (*a, *b))
            .collect();
        repairs.broken_pairs = before - self.sessions.len();

        let mut seen = HashSet::new();
        let sessions = &self.sessions;
        self.queue.retain(|id| {
            if sessions.contains_key(id) {
                repairs.paired_waiters += 1;
                false
            } else if !seen.insert(*id) {
                repairs.duplicate_waiters += 1;
                false
            } else {
                true
            }
        });

        repairs
    }
}

/// File-backed snapshot persistence.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Store backed by `path`. Nothing is touched until the first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the snapshot on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, the temp write, or the rename fails.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), TandemError> {
        let contents = serde_json::to_vec(snapshot)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, &contents)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Read the last snapshot, falling back to empty state on any failure.
    #[must_use]
    pub fn load(&self) -> Snapshot {
        let mut snapshot = match self.try_load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(path = %self.path.display(), "no snapshot found, starting empty");
                return Snapshot::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable snapshot, starting empty");
                return Snapshot::default();
            }
        };

        let repairs = snapshot.sanitize();
        if !repairs.is_clean() {
            warn!(
                broken_pairs = repairs.broken_pairs,
                duplicate_waiters = repairs.duplicate_waiters,
                paired_waiters = repairs.paired_waiters,
                "repaired inconsistent snapshot"
            );
        }
        snapshot
    }

    /// Strict variant of [`load`](Self::load): `Ok(None)` if the file is
    /// missing, no sanitizing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn try_load(&self) -> Result<Option<Snapshot>, TandemError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Delete the snapshot file. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed.
    pub fn remove(&self) -> Result<(), TandemError> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
