//! Pipeline stages and the store that moves artifacts between them.
//!
//! Each stage is a directory; the directory holding a file is the artifact's
//! state. [`ArtifactStore`] is the only way the pipeline touches those
//! directories, so the state machine can run against [`MemoryStore`] in tests.

mod fs_store;
mod layout;
mod memory;

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;
use tracerelay_mover::MoveError;

pub use fs_store::FsStore;
pub use layout::StageLayout;
pub use memory::MemoryStore;

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Source,
    Work,
    Done,
    FailedMove,
    DeadLetter,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Source,
        Stage::Work,
        Stage::Done,
        Stage::FailedMove,
        Stage::DeadLetter,
    ];

    /// Terminal stages are never polled again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::FailedMove | Stage::DeadLetter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Source => "source",
            Stage::Work => "work",
            Stage::Done => "done",
            Stage::FailedMove => "failed_move",
            Stage::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful [`ArtifactStore::move_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveReceipt {
    /// Name the artifact now has in the destination stage.
    pub file_name: String,
    /// Attempts the move took.
    pub attempts: u32,
}

/// Where an artifact's bytes can be read from.
#[derive(Debug, Clone)]
pub enum ArtifactContent {
    /// A file on disk. Readers stream it instead of loading it whole.
    File(PathBuf),
    /// Content held in memory.
    Memory(Bytes),
}

/// Repository over the stage directories.
///
/// All methods block; async callers run them on the blocking pool.
pub trait ArtifactStore: Send + Sync {
    /// Lists artifact names in `stage`, sorted. Hidden entries are skipped.
    fn list(&self, stage: Stage) -> io::Result<Vec<String>>;

    /// Moves `name` from one stage to another without overwriting anything.
    fn move_to(&self, name: &str, from: Stage, to: Stage) -> Result<MoveReceipt, MoveError>;

    /// Locates the content of `name` in `stage` without reading it.
    fn open(&self, stage: Stage, name: &str) -> io::Result<ArtifactContent>;
}

/// Names starting with a dot are in-progress copies or editor droppings.
pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}
