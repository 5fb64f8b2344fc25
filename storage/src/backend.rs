//! Persistence backends for ledger snapshots.
//!
//! - [`FileBackend`]: one JSON file per database, replaced atomically and
//!   owned by a single process through an advisory lock on `<file>.lock`
//! - [`MemoryBackend`]: shared in-process slot for tests and ephemeral use

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::engine::Snapshot;
use crate::error::StoreError;

/// Where a [`Database`](crate::Database) keeps its snapshot.
pub trait Backend: Send + Sync {
    /// Load the last saved snapshot, or `None` for a fresh database.
    fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Persist a full snapshot. Either the whole snapshot is saved or the
    /// previous one remains.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// JSON file on disk.
///
/// Each database keeps its own copy of the ledger in memory and rewrites the
/// whole file on every commit, so two handles on one file would overwrite
/// each other. [`FileBackend::open`] therefore takes an exclusive lock on a
/// sibling `.lock` file; clones share it and it is released when the last
/// clone is dropped.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
    _lock: Arc<File>,
}

impl FileBackend {
    /// Claim the ledger at `path`. Fails with [`StoreError::Locked`] while
    /// another handle, in this process or another, holds it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let lock_path = sibling(&path, ".lock");
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if let Err(e) = lock.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(StoreError::Locked { path });
            }
            return Err(e.into());
        }
        debug!("locked {}", lock_path.display());

        Ok(Self {
            path,
            _lock: Arc::new(lock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("ledger"));
    name.push(suffix);
    path.with_file_name(name)
}

impl Backend for FileBackend {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&contents)?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        // Write to a temp file in the same directory, then rename for atomicity.
        let tmp_path = sibling(&self.path, ".tmp");
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        trace!("saved {} to {}", snapshot.name, self.path.display());
        Ok(())
    }
}

/// In-memory slot. Clones share the same slot, so a database can be
/// "reopened" from a clone to observe what was persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    slot: Arc<Mutex<Option<Snapshot>>>,
    fail_saves: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-seeded with a snapshot.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let backend = Self::new();
        *backend.slot.lock() = Some(snapshot);
        backend
    }

    /// Last persisted snapshot.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.slot.lock().clone()
    }

    /// Make every subsequent save fail with [`StoreError::Unavailable`].
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl Backend for MemoryBackend {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(String::from(
                "memory backend is rejecting writes",
            )));
        }
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }
}
