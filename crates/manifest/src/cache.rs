//! Reloadable manifest view.
//!
//! The capture process keeps appending to the manifest while the relay runs,
//! so the index is rebuilt whenever the file's length or mtime changes. Readers
//! always get a consistent `Arc<ManifestIndex>` snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use crate::ManifestError;
use crate::index::{ManifestIndex, ParseMode, ParseReport};

/// Result of a [`ManifestCache::refresh`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// File unchanged since the last load (or the cache is fixed).
    Unchanged,
    /// File changed and was parsed again.
    Reloaded(ParseReport),
    /// File does not exist; the index is now empty.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

struct CacheState {
    index: Arc<ManifestIndex>,
    stamp: Option<FileStamp>,
}

/// Holds the current manifest snapshot and reloads it on change.
pub struct ManifestCache {
    path: Option<PathBuf>,
    source_dir: PathBuf,
    mode: ParseMode,
    state: RwLock<CacheState>,
}

impl ManifestCache {
    /// Creates a cache backed by the manifest at `path`. Nothing is read until
    /// the first [`refresh`](Self::refresh).
    pub fn new(path: impl Into<PathBuf>, source_dir: impl Into<PathBuf>, mode: ParseMode) -> Self {
        Self {
            path: Some(path.into()),
            source_dir: source_dir.into(),
            mode,
            state: RwLock::new(CacheState {
                index: Arc::new(ManifestIndex::empty()),
                stamp: None,
            }),
        }
    }

    /// Creates a cache that always serves `index` and never touches disk.
    pub fn fixed(index: ManifestIndex) -> Self {
        Self {
            path: None,
            source_dir: PathBuf::new(),
            mode: ParseMode::default(),
            state: RwLock::new(CacheState {
                index: Arc::new(index),
                stamp: None,
            }),
        }
    }

    /// Path of the backing manifest file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the current snapshot.
    pub fn current(&self) -> Arc<ManifestIndex> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state.index)
    }

    /// Reloads the manifest if the file changed.
    ///
    /// On error the previous snapshot stays in place. I/O errors are transient
    /// from the caller's point of view; [`ManifestError::Malformed`] is not.
    pub fn refresh(&self) -> Result<RefreshOutcome, ManifestError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(RefreshOutcome::Unchanged);
        };

        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                if state.stamp.is_some() || !state.index.is_empty() {
                    tracing::warn!(path = %path.display(), "manifest file disappeared");
                }
                state.index = Arc::new(ManifestIndex::empty());
                state.stamp = None;
                return Ok(RefreshOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        let stamp = FileStamp {
            len: meta.len(),
            modified: meta.modified().ok(),
        };
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if state.stamp == Some(stamp) {
                return Ok(RefreshOutcome::Unchanged);
            }
        }

        let (index, report) = ManifestIndex::load(path, &self.source_dir, self.mode)?;
        tracing::debug!(
            path = %path.display(),
            entries = index.len(),
            accepted = report.accepted,
            rejected = report.rejected,
            "manifest reloaded"
        );

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.index = Arc::new(index);
        state.stamp = Some(stamp);
        Ok(RefreshOutcome::Reloaded(report))
    }
}
