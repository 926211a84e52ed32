//! Backup manager
//!
//! Snapshots are full copies of the store file named
//! `<store-filename>.bak_<YYYYMMDD_HHMMSS>`. The fixed-width stamp makes name
//! order chronological, so retention is plain FIFO over sorted names.

use crate::error::{Error, Result};
use crate::store::KeyStore;
use bisspro_common::time::{backup_stamp, local_now_seconds, parse_backup_stamp};
use chrono::{Duration, NaiveDateTime};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Time source for snapshot names
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Snapshot file name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupId(String);

impl BackupId {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self(file_name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An existing snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub id: BackupId,
    pub path: PathBuf,
    /// Time encoded in the file name
    pub created: NaiveDateTime,
    pub size_bytes: u64,
}

/// Creates, lists, evicts and restores snapshots of one store file
#[derive(Clone)]
pub struct BackupManager {
    store_path: PathBuf,
    clock: Clock,
}

impl fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupManager")
            .field("store_path", &self.store_path)
            .finish()
    }
}

fn io_write_error(path: &Path, err: std::io::Error) -> Error {
    Error::Write {
        path: path.to_path_buf(),
        source: bisspro_common::Error::Io(err),
    }
}

impl BackupManager {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            clock: Arc::new(local_now_seconds),
        }
    }

    /// Replace the wall clock (tests use a fixed or stepping clock)
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    fn directory(&self) -> PathBuf {
        match self.store_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// `<store-filename>.bak_`
    fn prefix(&self) -> String {
        let name = self
            .store_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}.bak_", name)
    }

    fn path_for(&self, id: &BackupId) -> PathBuf {
        self.directory().join(id.as_str())
    }

    /// Copy the live store to a new snapshot
    ///
    /// Returns `None` when there is no store file yet. The stamp is the
    /// current second, or one second past the newest existing snapshot if
    /// that is later, so a new snapshot always sorts last.
    pub fn snapshot(&self) -> Result<Option<BackupId>> {
        if !self.store_path.exists() {
            debug!(path = %self.store_path.display(), "No store file, snapshot skipped");
            return Ok(None);
        }

        let contents = std::fs::read(&self.store_path).map_err(|source| Error::Read {
            path: self.store_path.clone(),
            source,
        })?;

        let prefix = self.prefix();
        let mut at = (self.clock)();
        if let Some(newest) = self.list()?.last() {
            at = at.max(newest.created + Duration::seconds(1));
        }
        let (id, path) = loop {
            let id = BackupId::new(format!("{}{}", prefix, backup_stamp(at)));
            let path = self.path_for(&id);
            if !path.exists() {
                break (id, path);
            }
            at += Duration::seconds(1);
        };

        bisspro_common::fs::write_atomic(&path, &contents).map_err(|source| Error::Write {
            path: path.clone(),
            source,
        })?;

        info!(backup = %id, bytes = contents.len(), "Created store snapshot");
        Ok(Some(id))
    }

    /// Existing snapshots, oldest first
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        let dir = self.directory();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = self.prefix();
        let read_dir = std::fs::read_dir(&dir).map_err(|source| Error::Read {
            path: dir.clone(),
            source,
        })?;

        let mut backups = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| Error::Read {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(created) = name.strip_prefix(&prefix).and_then(parse_backup_stamp) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            backups.push(BackupInfo {
                id: BackupId::new(name),
                path: entry.path(),
                created,
                size_bytes,
            });
        }

        backups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(backups)
    }

    /// Delete the oldest snapshots until at most `retention` remain
    pub fn evict_excess(&self, retention: usize) -> Result<Vec<BackupId>> {
        let backups = self.list()?;
        let excess = backups.len().saturating_sub(retention);
        let mut evicted = Vec::with_capacity(excess);

        for backup in backups.into_iter().take(excess) {
            std::fs::remove_file(&backup.path).map_err(|e| io_write_error(&backup.path, e))?;
            debug!(backup = %backup.id, "Evicted snapshot");
            evicted.push(backup.id);
        }

        if !evicted.is_empty() {
            info!(evicted = evicted.len(), retention, "Applied backup retention");
        }
        Ok(evicted)
    }

    /// Snapshot, then apply retention
    pub fn rotate(&self, retention: usize) -> Result<Option<BackupId>> {
        let id = self.snapshot()?;
        if let Err(e) = self.evict_excess(retention) {
            // Snapshot already taken; eviction failure is only logged
            warn!(error = %e, "Backup eviction failed");
        }
        Ok(id)
    }

    /// Contents of a snapshot
    pub fn read(&self, id: &BackupId) -> Result<String> {
        let valid = id
            .as_str()
            .strip_prefix(&self.prefix())
            .and_then(parse_backup_stamp)
            .is_some();
        let path = self.path_for(id);
        if !valid || !path.is_file() {
            return Err(Error::BackupNotFound(id.to_string()));
        }

        std::fs::read_to_string(&path).map_err(|source| Error::Read { path, source })
    }

    /// Overwrite the live store with a snapshot
    ///
    /// Does not restart anything; the caller decides.
    pub fn restore(&self, id: &BackupId) -> Result<KeyStore> {
        let text = self.read(id)?;
        bisspro_common::fs::write_atomic(&self.store_path, text.as_bytes()).map_err(
            |source| Error::Write {
                path: self.store_path.clone(),
                source,
            },
        )?;
        info!(backup = %id, "Restored store from snapshot");
        Ok(KeyStore::from_text(&self.store_path, &text))
    }
}
