//! Pipeline error types.

use std::time::Duration;

use tracerelay_manifest::ManifestError;

use crate::artifact::ArtifactState;

/// Errors produced while driving the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("shutdown requested")]
    ShutdownRequested,

    #[error("invalid transition for {artifact}: {from:?} -> {to:?}")]
    InvalidTransition {
        artifact: String,
        from: ArtifactState,
        to: ArtifactState,
    },

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("manifest load timed out after {0:?}")]
    ManifestTimeout(Duration),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Returns true for errors that must stop the run.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Manifest(e) => e.is_fatal(),
            _ => false,
        }
    }
}
