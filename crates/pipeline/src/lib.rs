//! Trace artifact transfer pipeline.
//!
//! Artifacts move `source -> work -> {done, dead_letter, failed_move}`; the
//! directory holding a file is its state. [`Orchestrator`] polls the
//! non-terminal stages and drives each artifact as its own task.

pub mod artifact;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod poller;

pub use artifact::{Artifact, ArtifactState};
pub use config::{MissingHashPolicy, PipelineConfig};
pub use error::PipelineError;
pub use events::{DeadLetterReason, TerminalOutcome, TransferEvent};
pub use orchestrator::{ArtifactResult, CycleReport, Orchestrator};
pub use poller::{DirectoryPoller, Scan, WorkItem};
