//! File-backed staging area for serialized batches
//!
//! Each flushed batch becomes one staged unit: a file in a flat directory,
//! named with a random UUID, holding newline-separated envelopes. Units move
//! between three states:
//!
//! ```text
//! persist() ──► available ──next_available()──► in-flight ──delete_unit()──► deleted
//!                   ▲                               │
//!                   └────────── release() ──────────┘
//! ```
//!
//! In-flight units are tracked in an in-memory served set. It is not
//! persisted, so after a restart every file on disk is available again.
//! A unit whose file cannot be deleted stays in the served set, so this
//! process never hands it out again.
//!
//! Every operation degrades instead of failing: a missing directory means no
//! units, a failed write means the batch is dropped, a failed read yields an
//! empty string.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use uuid::Uuid;

use crate::stats::PipelineStats;

/// Separator between envelopes inside a staged unit
pub const RECORD_SEPARATOR: &str = "\n";

const TEMP_SUFFIX: &str = ".tmp";

/// Handle to one staged unit on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagedUnit {
    id: String,
    path: PathBuf,
}

impl StagedUnit {
    /// Opaque unique identifier (the file name)
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Durable holding area between batching and delivery
pub struct StagingStore {
    dir: PathBuf,
    max_units: usize,
    /// Identifiers currently claimed by an in-flight send
    served: Mutex<HashSet<String>>,
    /// Serializes the capacity check with the write that follows it
    persist_lock: Mutex<()>,
    stats: Arc<PipelineStats>,
    #[cfg(test)]
    fail_deletes: std::sync::atomic::AtomicBool,
}

impl StagingStore {
    /// Create a store rooted at `dir` that holds at most `max_units` units.
    ///
    /// The directory is created lazily on first write.
    pub fn new(dir: impl Into<PathBuf>, max_units: usize) -> Self {
        Self::with_stats(dir, max_units, Arc::new(PipelineStats::default()))
    }

    pub(crate) fn with_stats(
        dir: impl Into<PathBuf>,
        max_units: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            dir: dir.into(),
            max_units,
            served: Mutex::new(HashSet::new()),
            persist_lock: Mutex::new(()),
            stats,
            #[cfg(test)]
            fail_deletes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Staging directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_units(&self) -> usize {
        self.max_units
    }

    /// Write `batch` as a new staged unit.
    ///
    /// Returns true if a unit was written. The batch is dropped (and logged)
    /// when the store is at capacity or the write fails.
    pub fn persist(&self, batch: &[String]) -> bool {
        if batch.is_empty() {
            return false;
        }

        // Never taken together with the served lock
        let _persisting = self
            .persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !self.has_free_space() {
            tracing::warn!(
                dir = %self.dir.display(),
                max_units = self.max_units,
                events = batch.len(),
                "Staging store full, dropping batch"
            );
            self.stats.record_batch_dropped();
            return false;
        }

        match self.write_unit(&batch.join(RECORD_SEPARATOR)) {
            Ok(unit) => {
                tracing::debug!(unit = %unit.id, events = batch.len(), "Staged batch");
                self.stats.record_batch_staged();
                true
            }
            Err(e) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    error = %e,
                    "Failed to stage batch"
                );
                self.stats.record_batch_dropped();
                false
            }
        }
    }

    /// Claim the oldest unit that is not already in flight.
    ///
    /// Ordering is best-effort (modification time, then name); filesystems
    /// do not guarantee monotonic timestamps.
    pub fn next_available(&self) -> Option<StagedUnit> {
        let units = self.list_units();
        let mut served = self.served();
        let unit = units.into_iter().find(|unit| !served.contains(&unit.id))?;
        served.insert(unit.id.clone());
        Some(unit)
    }

    /// Read a unit's content, or an empty string if it cannot be read
    pub fn load(&self, unit: &StagedUnit) -> String {
        match fs::read_to_string(&unit.path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(unit = %unit.id, error = %e, "Failed to load staged unit");
                String::new()
            }
        }
    }

    /// Remove a unit from disk and from the served set.
    ///
    /// Returns true if the file is gone. When the delete fails the unit
    /// stays claimed, so it is not re-sent for the rest of this process.
    pub fn delete_unit(&self, unit: &StagedUnit) -> bool {
        let removed = match self.remove_file(&unit.path) {
            Ok(()) => {
                tracing::debug!(unit = %unit.id, "Deleted staged unit");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(unit = %unit.id, "Staged unit already removed");
                true
            }
            Err(e) => {
                tracing::warn!(
                    unit = %unit.id,
                    error = %e,
                    "Failed to delete staged unit, keeping it claimed"
                );
                false
            }
        };

        if removed {
            self.served().remove(&unit.id);
        }
        removed
    }

    /// Return a unit to the available pool, leaving it on disk
    pub fn release(&self, unit: &StagedUnit) {
        if self.served().remove(&unit.id) {
            tracing::debug!(unit = %unit.id, "Released staged unit");
        }
    }

    /// Number of units currently on disk
    pub fn staged_count(&self) -> usize {
        self.list_units().len()
    }

    /// Whether `unit` is claimed by an in-flight send
    pub fn is_served(&self, unit: &StagedUnit) -> bool {
        self.served().contains(&unit.id)
    }

    fn has_free_space(&self) -> bool {
        self.staged_count() < self.max_units
    }

    #[cfg(not(test))]
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    #[cfg(test)]
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        use std::sync::atomic::Ordering;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "deletes disabled for test",
            ));
        }
        fs::remove_file(path)
    }

    /// Make every later delete fail as if the directory were read-only
    #[cfg(test)]
    pub(crate) fn fail_deletes(&self) {
        self.fail_deletes
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn served(&self) -> MutexGuard<'_, HashSet<String>> {
        self.served.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write to a hidden temp file, then rename into place
    fn write_unit(&self, content: &str) -> io::Result<StagedUnit> {
        fs::create_dir_all(&self.dir)?;

        let id = Uuid::new_v4().to_string();
        let tmp_path = self.dir.join(format!(".{}{}", id, TEMP_SUFFIX));
        let path = self.dir.join(&id);

        fs::write(&tmp_path, content)?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        Ok(StagedUnit { id, path })
    }

    /// Staged units on disk, oldest first. Temp files are skipped.
    fn list_units(&self) -> Vec<StagedUnit> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to list staging directory");
                return Vec::new();
            }
        };

        let mut units: Vec<(SystemTime, StagedUnit)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                if !metadata.is_file() {
                    return None;
                }
                let id = entry.file_name().into_string().ok()?;
                if id.starts_with('.') {
                    return None;
                }
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((
                    modified,
                    StagedUnit {
                        id,
                        path: entry.path(),
                    },
                ))
            })
            .collect();

        units.sort_by(|(a_time, a), (b_time, b)| a_time.cmp(b_time).then_with(|| a.id.cmp(&b.id)));
        units.into_iter().map(|(_, unit)| unit).collect()
    }
}
