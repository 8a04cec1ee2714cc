use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::ManifestError;
use crate::digest::is_sha256_hex;

/// One manifest record, keyed by the artifact's filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Final path component of `source_path`.
    pub filename: String,
    /// Lowercase SHA-256 hex digest.
    pub expected_hash: String,
    /// When the capture process wrote the record.
    pub recorded_at: DateTime<Utc>,
    /// Full path the artifact was written to.
    pub source_path: PathBuf,
}

/// How invalid records are treated while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Skip invalid records with a warning.
    #[default]
    Lenient,
    /// Fail the whole load on the first invalid record.
    Strict,
}

/// Summary of a parse pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseReport {
    /// Records added to the index.
    pub accepted: usize,
    /// Records skipped as invalid (lenient mode only).
    pub rejected: usize,
    /// Records that replaced an earlier record for the same filename.
    pub replaced: usize,
    /// The last line had no newline and did not parse. It is left for the
    /// next load, once the writer finishes it.
    pub incomplete_tail: bool,
}

/// Why a single manifest record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("expected 3 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid epoch timestamp: {0:?}")]
    BadEpoch(String),

    #[error("empty file path")]
    EmptyPath,

    #[error("relative file path not allowed: {0}")]
    RelativePath(String),

    #[error("file path outside source directory: {0}")]
    OutsideSource(String),

    #[error("invalid sha256 digest: {0:?}")]
    BadHash(String),
}

/// Immutable filename -> expected hash mapping.
#[derive(Debug, Clone, Default)]
pub struct ManifestIndex {
    entries: HashMap<String, ManifestEntry>,
}

impl ManifestIndex {
    /// An index with no records.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds an index from already-validated entries. Later entries win.
    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| (e.filename.clone(), e))
            .collect();
        Self { entries }
    }

    /// Parses manifest text.
    ///
    /// Records must point at a file directly inside `source_dir`. In
    /// [`ParseMode::Strict`] the first invalid record fails the parse with
    /// [`ManifestError::Malformed`].
    pub fn parse(
        text: &str,
        source_dir: &Path,
        mode: ParseMode,
    ) -> Result<(Self, ParseReport), ManifestError> {
        let mut entries: HashMap<String, ManifestEntry> = HashMap::new();
        let mut report = ParseReport::default();
        let unterminated_line = if text.is_empty() || text.ends_with('\n') {
            None
        } else {
            Some(text.lines().count())
        };

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            match parse_record(line, source_dir) {
                Ok(entry) => {
                    report.accepted += 1;
                    if entries.insert(entry.filename.clone(), entry).is_some() {
                        report.replaced += 1;
                    }
                }
                Err(e) if unterminated_line == Some(line_no) => {
                    tracing::debug!(line = line_no, error = %e, "manifest ends mid-record, ignoring last line");
                    report.incomplete_tail = true;
                }
                Err(e) => match mode {
                    ParseMode::Strict => {
                        return Err(ManifestError::Malformed {
                            line: line_no,
                            reason: e.to_string(),
                        });
                    }
                    ParseMode::Lenient => {
                        tracing::warn!(line = line_no, error = %e, "skipping invalid manifest record");
                        report.rejected += 1;
                    }
                },
            }
        }

        Ok((Self { entries }, report))
    }

    /// Reads and parses a manifest file.
    ///
    /// Content that is not UTF-8 is [`ManifestError::Malformed`] regardless of mode.
    pub fn load(
        path: &Path,
        source_dir: &Path,
        mode: ParseMode,
    ) -> Result<(Self, ParseReport), ManifestError> {
        let bytes = std::fs::read(path)?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            // Cut off inside a multi-byte character by an append in progress.
            Err(e) if e.utf8_error().error_len().is_none() => {
                let valid = e.utf8_error().valid_up_to();
                String::from_utf8_lossy(&e.as_bytes()[..valid]).into_owned()
            }
            Err(e) => {
                return Err(ManifestError::Malformed {
                    line: line_of_offset(e.as_bytes(), e.utf8_error().valid_up_to()),
                    reason: "manifest is not valid UTF-8".into(),
                });
            }
        };
        Self::parse(&text, source_dir, mode)
    }

    /// Returns the expected hash for `filename`.
    pub fn lookup(&self, filename: &str) -> Result<&str, ManifestError> {
        self.entries
            .get(filename)
            .map(|e| e.expected_hash.as_str())
            .ok_or_else(|| ManifestError::NotFound(filename.to_string()))
    }

    #[cfg(test)]
    fn entry(&self, filename: &str) -> Option<&ManifestEntry> {
        self.entries.get(filename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_record(line: &str, source_dir: &Path) -> Result<ManifestEntry, RecordError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(RecordError::FieldCount(fields.len()));
    }
    let (epoch, path, hash) = (fields[0], fields[1], fields[2]);

    let recorded_at = epoch
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| RecordError::BadEpoch(epoch.to_string()))?;

    if path.is_empty() {
        return Err(RecordError::EmptyPath);
    }
    let source_path = PathBuf::from(path);
    if !source_path.is_absolute() {
        return Err(RecordError::RelativePath(path.to_string()));
    }
    if source_path.parent() != Some(source_dir) {
        return Err(RecordError::OutsideSource(path.to_string()));
    }
    let filename = source_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(RecordError::EmptyPath)?
        .to_string();

    if !is_sha256_hex(hash) {
        return Err(RecordError::BadHash(hash.to_string()));
    }

    Ok(ManifestEntry {
        filename,
        expected_hash: hash.to_ascii_lowercase(),
        recorded_at,
        source_path,
    })
}

/// 1-based line number containing byte `offset`.
fn line_of_offset(bytes: &[u8], offset: usize) -> usize {
    bytes[..offset.min(bytes.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}
