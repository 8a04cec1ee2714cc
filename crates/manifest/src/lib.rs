//! Trace manifest: maps artifact filenames to their expected content hash.
//!
//! The manifest is a text file appended to by the capture process, one record
//! per line:
//!
//! ```text
//! <epoch seconds>,<absolute file path>,<sha256 hex>
//! ```
//!
//! [`ManifestIndex`] is the immutable, parsed view; [`ManifestCache`] reloads it
//! when the file changes on disk.

mod cache;
mod digest;
mod index;

pub use cache::{ManifestCache, RefreshOutcome};
pub use digest::{is_sha256_hex, sha256_file, sha256_hex};
pub use index::{ManifestEntry, ManifestIndex, ParseMode, ParseReport, RecordError};

/// Errors produced by manifest operations.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// No record exists for the requested filename. This is a normal outcome,
    /// the caller decides what it means.
    #[error("no manifest entry for {0}")]
    NotFound(String),

    /// The manifest cannot be trusted as a whole.
    #[error("malformed manifest at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    /// Returns true for errors that must stop the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}
