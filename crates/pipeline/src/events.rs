//! Events emitted while artifacts move through the pipeline.

use std::time::Duration;

use serde::Serialize;
use tracerelay_stage::Stage;

/// Why an artifact was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The endpoint refused it.
    Rejected { reason: String },
    /// Staged content does not hash to the manifest value.
    HashMismatch { expected: String, actual: String },
    /// No manifest entry and the policy says not to upload.
    ManifestMiss,
    /// Retryable failures used up the attempt budget.
    RetriesExhausted { attempts: u32, last: String },
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { reason } => write!(f, "rejected: {reason}"),
            Self::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch: expected {expected}, got {actual}")
            }
            Self::ManifestMiss => f.write_str("no manifest entry"),
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempt(s): {last}")
            }
        }
    }
}

/// Final placement of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Done,
    DeadLettered { reason: DeadLetterReason },
    /// A move failed. `delivered` is set when the endpoint already has it.
    FailedMove { delivered: bool, reason: String },
}

impl TerminalOutcome {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Done => Stage::Done,
            Self::DeadLettered { .. } => Stage::DeadLetter,
            Self::FailedMove { .. } => Stage::FailedMove,
        }
    }
}

/// Progress of one artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Discovered {
        artifact: String,
        stage: Stage,
    },
    Staged {
        artifact: String,
        placed_as: String,
    },
    Verified {
        artifact: String,
        has_hash: bool,
    },
    UploadAttempt {
        artifact: String,
        attempt: u32,
    },
    RetryScheduled {
        artifact: String,
        attempt: u32,
        delay: Duration,
    },
    /// Left in work for a later cycle.
    Deferred {
        artifact: String,
    },
    Finished {
        artifact: String,
        outcome: TerminalOutcome,
    },
}

impl TransferEvent {
    pub fn artifact(&self) -> &str {
        match self {
            Self::Discovered { artifact, .. }
            | Self::Staged { artifact, .. }
            | Self::Verified { artifact, .. }
            | Self::UploadAttempt { artifact, .. }
            | Self::RetryScheduled { artifact, .. }
            | Self::Deferred { artifact }
            | Self::Finished { artifact, .. } => artifact,
        }
    }
}
