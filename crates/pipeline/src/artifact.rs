//! Per-artifact state machine.

use serde::Serialize;
use tracerelay_mover::logical_name;
use tracerelay_stage::Stage;

use crate::error::PipelineError;

/// Where an artifact is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    /// Seen in source, not moved yet.
    Discovered,
    /// In work, manifest not consulted yet.
    Staged,
    /// Manifest has a hash for it.
    Verified,
    /// Manifest has no entry for it.
    Unverified,
    Uploading,
    /// Accepted by the endpoint, still in work.
    Delivered,
    Done,
    DeadLettered,
    FailedMove,
}

impl ArtifactState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::DeadLettered | Self::FailedMove)
    }

    /// Stage directory that holds the artifact in this state.
    pub fn stage(self) -> Stage {
        match self {
            Self::Discovered => Stage::Source,
            Self::Staged | Self::Verified | Self::Unverified | Self::Uploading | Self::Delivered => {
                Stage::Work
            }
            Self::Done => Stage::Done,
            Self::DeadLettered => Stage::DeadLetter,
            Self::FailedMove => Stage::FailedMove,
        }
    }

    fn can_become(self, next: Self) -> bool {
        use ArtifactState::*;
        matches!(
            (self, next),
            (Discovered, Staged | FailedMove)
                | (Staged, Verified | Unverified)
                | (Verified | Unverified, Uploading | DeadLettered | FailedMove)
                | (Uploading, Delivered | DeadLettered | FailedMove)
                | (Delivered, Done | FailedMove)
        )
    }
}

/// One trace file tracked through the pipeline.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Name the artifact arrived with; manifest lookups use it.
    pub filename: String,
    /// Current file name inside its stage directory.
    pub placed_name: String,
    /// Picked up from work, so `filename` may be a collision name rather than
    /// the arrival name.
    pub resumed: bool,
    pub state: ArtifactState,
    pub expected_hash: Option<String>,
    pub move_attempts: u32,
    pub upload_attempts: u32,
}

impl Artifact {
    /// A new arrival in source.
    pub fn discovered(name: &str) -> Self {
        Self::at(name, ArtifactState::Discovered)
    }

    /// A file found in work, left there by an earlier run or cycle.
    pub fn recovered(name: &str) -> Self {
        Self::at(name, ArtifactState::Staged)
    }

    /// A file in work the endpoint has already accepted.
    pub fn delivered(name: &str) -> Self {
        Self::at(name, ArtifactState::Delivered)
    }

    fn at(name: &str, state: ArtifactState) -> Self {
        Self {
            filename: name.to_string(),
            placed_name: name.to_string(),
            resumed: state != ArtifactState::Discovered,
            state,
            expected_hash: None,
            move_attempts: 0,
            upload_attempts: 0,
        }
    }

    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    /// Manifest keys to try, in order. A resumed artifact falls back to the
    /// name with any collision suffix removed.
    pub fn manifest_keys(&self) -> Vec<String> {
        let mut keys = vec![self.filename.clone()];
        if self.resumed {
            let logical = logical_name(&self.filename);
            if logical != self.filename {
                keys.push(logical);
            }
        }
        keys
    }

    /// Moves to `next`, rejecting transitions the pipeline never makes.
    ///
    /// Counters reset whenever the stage directory changes.
    pub fn transition(&mut self, next: ArtifactState) -> Result<(), PipelineError> {
        if !self.state.can_become(next) {
            return Err(PipelineError::InvalidTransition {
                artifact: self.placed_name.clone(),
                from: self.state,
                to: next,
            });
        }
        if self.state.stage() != next.stage() {
            self.move_attempts = 0;
            self.upload_attempts = 0;
        }
        self.state = next;
        Ok(())
    }
}
