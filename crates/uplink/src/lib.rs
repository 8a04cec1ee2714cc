//! Uploading artifacts to the collection endpoint.
//!
//! An upload is a single request. Its result is classified into
//! [`UploadOutcome`]; retry pacing is the caller's job, using
//! [`BackoffPolicy`].

mod backoff;
mod classify;
mod http;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;

pub use backoff::{BackoffPolicy, BackoffState, next_delay};
pub use classify::{classify_error, classify_status};
pub use http::{HttpUploader, HttpUploaderConfig, parse_endpoint};

/// Errors building an uploader.
#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    #[error("invalid endpoint URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid {name} header value {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Transport-level failure of one request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("retryable network error: {0}")]
    Retryable(String),

    #[error("permanent network error: {0}")]
    Permanent(String),
}

/// Where a request body comes from.
#[derive(Debug, Clone)]
pub enum UploadBody {
    /// Content already in memory. Clones share the buffer.
    Bytes(Bytes),
    /// A file, streamed from disk in chunks on every attempt.
    File(PathBuf),
}

/// One artifact to send.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Name sent to the endpoint.
    pub filename: String,
    pub body: UploadBody,
    /// Hex SHA-256 from the manifest, when known.
    pub expected_hash: Option<String>,
}

/// Classified result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success { status: u16 },
    RetryableFailure { reason: String },
    PermanentFailure { reason: String },
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableFailure { .. })
    }
}

impl From<NetworkError> for UploadOutcome {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Retryable(reason) => Self::RetryableFailure { reason },
            NetworkError::Permanent(reason) => Self::PermanentFailure { reason },
        }
    }
}

/// Sends one artifact to the remote endpoint.
///
/// Implementations never retry internally.
pub trait Uploader: Send + Sync {
    fn upload<'a>(
        &'a self,
        request: &'a UploadRequest,
    ) -> Pin<Box<dyn Future<Output = UploadOutcome> + Send + 'a>>;
}
