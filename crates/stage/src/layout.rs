use std::io;
use std::path::{Path, PathBuf};

use crate::Stage;

/// Directories backing each stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLayout {
    pub source: PathBuf,
    pub work: PathBuf,
    pub done: PathBuf,
    pub failed_move: PathBuf,
    pub dead_letter: PathBuf,
}

impl StageLayout {
    /// Lays out all stages as subdirectories of `root`, named after the stage.
    pub fn under(root: &Path) -> Self {
        Self {
            source: root.join(Stage::Source.as_str()),
            work: root.join(Stage::Work.as_str()),
            done: root.join(Stage::Done.as_str()),
            failed_move: root.join(Stage::FailedMove.as_str()),
            dead_letter: root.join(Stage::DeadLetter.as_str()),
        }
    }

    pub fn dir(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Source => &self.source,
            Stage::Work => &self.work,
            Stage::Done => &self.done,
            Stage::FailedMove => &self.failed_move,
            Stage::DeadLetter => &self.dead_letter,
        }
    }

    /// Creates every missing stage directory.
    ///
    /// Fails if a stage path exists but is not a directory.
    pub fn create_all(&self) -> io::Result<()> {
        for stage in Stage::ALL {
            let dir = self.dir(stage);
            if dir.exists() && !dir.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{stage} path is not a directory: {}", dir.display()),
                ));
            }
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
