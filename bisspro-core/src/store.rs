//! Key store
//!
//! The store is an owned, in-memory copy of the key file. Components take a
//! `&KeyStore` / `&mut KeyStore` instead of reopening the file. Loading and
//! saving happen at explicit boundaries; saving always goes through an
//! atomic temp-file + rename write.
//!
//! Lines that are not records (comments, blank lines, other CAS sections)
//! and marker lines that fail to parse are kept verbatim in position, so a
//! save never drops anything the engine does not own.
//!
//! At most one record per composite identity is active. When a file holds
//! several lines for one identity, the first is kept and the later ones are
//! dropped on load, so the next save removes them.

use crate::codec::{self, LineKind};
use crate::error::{Error, Result};
use crate::models::{CompositeIdentity, KeyRecord};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One line of the store file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEntry {
    Record(KeyRecord),
    /// Preserved verbatim
    Raw(String),
}

impl StoreEntry {
    pub fn record(&self) -> Option<&KeyRecord> {
        match self {
            StoreEntry::Record(r) => Some(r),
            StoreEntry::Raw(_) => None,
        }
    }

    fn render(&self) -> String {
        match self {
            StoreEntry::Record(r) => codec::serialize(r),
            StoreEntry::Raw(line) => line.clone(),
        }
    }
}

/// In-memory key store bound to its backing file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStore {
    path: PathBuf,
    entries: Vec<StoreEntry>,
    skipped_lines: usize,
    duplicate_lines: usize,
}

impl KeyStore {
    /// Empty store that will be written to `path`
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            skipped_lines: 0,
            duplicate_lines: 0,
        }
    }

    /// Read the store file; a missing file is an empty store
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "Store file absent, starting empty");
            return Ok(Self::empty(path));
        }

        let text = std::fs::read_to_string(&path).map_err(|source| Error::Read {
            path: path.clone(),
            source,
        })?;
        let store = Self::from_text(path, &text);

        info!(
            path = %store.path.display(),
            records = store.record_count(),
            skipped = store.skipped_lines,
            duplicates = store.duplicate_lines,
            "Loaded key store"
        );
        Ok(store)
    }

    /// Build a store from file contents
    pub fn from_text(path: impl Into<PathBuf>, text: &str) -> Self {
        let mut store = Self::empty(path);
        let mut seen = HashSet::new();
        for (i, line) in text.lines().enumerate() {
            let entry = match codec::classify_line(line) {
                LineKind::Record(record) if !seen.insert(record.identity) => {
                    warn!(
                        line = i + 1,
                        identity = %record.identity,
                        "Duplicate identity in store, later line dropped"
                    );
                    store.duplicate_lines += 1;
                    continue;
                }
                LineKind::Record(record) => StoreEntry::Record(record),
                LineKind::NotARecord => StoreEntry::Raw(line.to_string()),
                LineKind::Malformed(e) => {
                    warn!(line = i + 1, error = %e, "Malformed store line kept verbatim");
                    store.skipped_lines += 1;
                    StoreEntry::Raw(line.to_string())
                }
            };
            store.entries.push(entry);
        }
        store
    }

    /// File contents for the current entries
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.render());
            out.push('\n');
        }
        out
    }

    /// Persist atomically to the backing file
    pub fn save(&self) -> Result<()> {
        bisspro_common::fs::write_atomic(&self.path, self.render().as_bytes()).map_err(
            |source| Error::Write {
                path: self.path.clone(),
                source,
            },
        )?;
        debug!(path = %self.path.display(), records = self.record_count(), "Saved key store");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[StoreEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<StoreEntry> {
        &mut self.entries
    }

    /// Marker lines that failed to parse during load
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Later lines for an already loaded identity, dropped during load
    pub fn duplicate_lines(&self) -> usize {
        self.duplicate_lines
    }

    pub fn records(&self) -> impl Iterator<Item = &KeyRecord> {
        self.entries.iter().filter_map(StoreEntry::record)
    }

    pub fn record_count(&self) -> usize {
        self.records().count()
    }

    /// Entry index of the record with this composite identity
    pub fn position_of(&self, identity: &CompositeIdentity) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.record().map(|r| &r.identity == identity).unwrap_or(false))
    }

    pub fn find(&self, identity: &CompositeIdentity) -> Option<&KeyRecord> {
        self.records().find(|r| &r.identity == identity)
    }
}

/// Lazily loaded store: the file is read on first access
#[derive(Debug)]
pub struct StoreCell {
    path: PathBuf,
    store: Option<KeyStore>,
}

impl StoreCell {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.store.is_some()
    }

    /// Store contents, loading the file on first call
    pub fn get_mut(&mut self) -> Result<&mut KeyStore> {
        if self.store.is_none() {
            self.store = Some(KeyStore::load(&self.path)?);
        }
        match self.store.as_mut() {
            Some(store) => Ok(store),
            None => Err(Error::Task("store failed to load".to_string())),
        }
    }

    /// Swap in a store read elsewhere (e.g. a restored backup)
    pub fn replace(&mut self, store: KeyStore) {
        self.store = Some(store);
    }

    /// Forget the cached copy; the next access re-reads the file
    pub fn invalidate(&mut self) {
        self.store = None;
    }
}
