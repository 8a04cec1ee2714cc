use std::fs::FileType;
use std::io;
use std::path::Path;

use tracerelay_mover::{CollisionSafeMover, MoveError};
use tracing::warn;

use crate::{ArtifactContent, ArtifactStore, MoveReceipt, Stage, StageLayout, is_hidden};

/// [`ArtifactStore`] over real directories.
pub struct FsStore {
    layout: StageLayout,
    mover: CollisionSafeMover,
}

impl FsStore {
    pub fn new(layout: StageLayout, mover: CollisionSafeMover) -> Self {
        Self { layout, mover }
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }
}

impl ArtifactStore for FsStore {
    fn list(&self, stage: Stage) -> io::Result<Vec<String>> {
        let dir = self.layout.dir(stage);
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = listed_name(&entry.path(), entry.file_type()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn move_to(&self, name: &str, from: Stage, to: Stage) -> Result<MoveReceipt, MoveError> {
        let source = self.layout.dir(from).join(name);
        let placed = self.mover.move_into(&source, self.layout.dir(to))?;
        Ok(MoveReceipt {
            file_name: placed.file_name,
            attempts: placed.attempts,
        })
    }

    fn open(&self, stage: Stage, name: &str) -> io::Result<ArtifactContent> {
        let path = self.layout.dir(stage).join(name);
        if !std::fs::metadata(&path)?.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(ArtifactContent::File(path))
    }
}

/// Name to list for one directory entry, or `None` if it is skipped.
fn listed_name(path: &Path, file_type: io::Result<FileType>) -> Option<String> {
    match file_type {
        Ok(kind) if kind.is_file() => {}
        Ok(_) => return None,
        Err(e) => {
            // Usually the file moved away between listing and stat.
            warn!(entry = %path.display(), error = %e, "skipping entry that could not be inspected");
            return None;
        }
    }
    let Some(name) = path.file_name()?.to_str() else {
        warn!(entry = %path.display(), "skipping entry with non UTF-8 name");
        return None;
    };
    (!is_hidden(name)).then(|| name.to_string())
}
