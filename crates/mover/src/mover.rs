use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::MoveError;
use crate::naming::collision_name;
use crate::ops::{FileOps, StdFileOps};

/// Retry and collision bounds for moves.
#[derive(Debug, Clone)]
pub struct MoveConfig {
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
    /// Alternative names tried when the original name is taken.
    pub max_collision_attempts: u32,
}

impl Default for MoveConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(250),
            max_collision_attempts: 100,
        }
    }
}

/// Remaining transient-failure retries for one move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            remaining: max_retries,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Takes one retry. Returns false once the budget is spent.
    pub fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Where a moved file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Full destination path.
    pub path: PathBuf,
    /// Destination file name (differs from the source name after a collision).
    pub file_name: String,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

impl Placement {
    /// True if the file was placed under an alternative name.
    pub fn renamed_from(&self, original: &str) -> bool {
        self.file_name != original
    }
}

/// Moves files between directories without overwriting and without exposing
/// partial content.
///
/// Blocking: callers on an async runtime should run moves on the blocking
/// pool.
#[derive(Clone)]
pub struct CollisionSafeMover {
    config: MoveConfig,
    ops: Arc<dyn FileOps>,
}

impl CollisionSafeMover {
    /// Creates a mover backed by the real filesystem.
    pub fn new(config: MoveConfig) -> Self {
        Self::with_ops(config, Arc::new(StdFileOps))
    }

    /// Creates a mover over custom filesystem primitives.
    pub fn with_ops(config: MoveConfig, ops: Arc<dyn FileOps>) -> Self {
        Self { config, ops }
    }

    pub fn config(&self) -> &MoveConfig {
        &self.config
    }

    /// Moves `source` into `dest_dir`.
    ///
    /// Transient failures are retried up to `max_retries` times with a fixed
    /// delay; running out turns the failure into [`MoveError::Permanent`].
    /// On error the source is left in place.
    pub fn move_into(&self, source: &Path, dest_dir: &Path) -> Result<Placement, MoveError> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MoveError::Permanent {
                attempts: 0,
                reason: format!("source has no usable file name: {}", source.display()),
            })?
            .to_string();

        let mut budget = RetryBudget::new(self.config.max_retries);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.attempt(source, dest_dir, &name) {
                Ok(path) => {
                    let placement = Placement {
                        file_name: file_name_of(&path),
                        path,
                        attempts,
                    };
                    if placement.renamed_from(&name) {
                        info!(
                            artifact = %name,
                            placed_as = %placement.file_name,
                            dir = %dest_dir.display(),
                            "destination name taken, placed under alternative name"
                        );
                    }
                    if let Err(e) = self.ops.sync_dir(dest_dir) {
                        warn!(dir = %dest_dir.display(), error = %e, "failed to sync directory");
                    }
                    return Ok(placement);
                }
                Err(MoveError::Transient(e)) => {
                    if !budget.consume() {
                        return Err(MoveError::Permanent {
                            attempts,
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        artifact = %name,
                        attempt = attempts,
                        remaining = budget.remaining(),
                        error = %e,
                        "transient move failure, retrying"
                    );
                    std::thread::sleep(self.config.retry_delay);
                }
                Err(MoveError::Permanent { reason, .. }) => {
                    return Err(MoveError::Permanent { attempts, reason });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One placement attempt: pick a free name, then place the file there.
    fn attempt(&self, source: &Path, dest_dir: &Path, name: &str) -> Result<PathBuf, MoveError> {
        if !self.ops.try_exists(source).map_err(MoveError::from_io)? {
            return Err(MoveError::Permanent {
                attempts: 1,
                reason: format!("source missing: {}", source.display()),
            });
        }

        for n in 0..=self.config.max_collision_attempts {
            let candidate = if n == 0 {
                name.to_string()
            } else {
                collision_name(name, n)
            };
            let dest = dest_dir.join(&candidate);
            if dest == source {
                continue;
            }
            if self.ops.try_exists(&dest).map_err(MoveError::from_io)? {
                debug!(candidate = %candidate, "destination name taken");
                continue;
            }
            self.place(source, &dest)?;
            return Ok(dest);
        }

        Err(MoveError::CollisionExhausted {
            name: name.to_string(),
            attempts: self.config.max_collision_attempts,
        })
    }

    /// Renames `source` to `dest`, falling back to a verified copy when the
    /// two live on different filesystems.
    fn place(&self, source: &Path, dest: &Path) -> Result<(), MoveError> {
        match self.ops.rename(source, dest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                debug!(from = %source.display(), to = %dest.display(), "cross-device move, copying");
                self.copy_then_swap(source, dest)
            }
            Err(e) => Err(MoveError::from_io(e)),
        }
    }

    fn copy_then_swap(&self, source: &Path, dest: &Path) -> Result<(), MoveError> {
        let partial = dest.with_file_name(format!(".{}.partial", file_name_of(dest)));

        let copied = self
            .ops
            .copy_durable(source, &partial)
            .and_then(|_| self.ops.same_content(source, &partial));
        match copied {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.ops.remove_file(&partial);
                return Err(MoveError::Transient(io::Error::other(
                    "copied content does not match source",
                )));
            }
            Err(e) => {
                let _ = self.ops.remove_file(&partial);
                return Err(MoveError::from_io(e));
            }
        }

        if let Err(e) = self.ops.rename(&partial, dest) {
            let _ = self.ops.remove_file(&partial);
            return Err(MoveError::from_io(e));
        }

        if let Err(e) = self.ops.remove_file(source) {
            // Undo the placement so the artifact is never visible twice.
            if let Err(undo) = self.ops.remove_file(dest) {
                warn!(
                    dest = %dest.display(),
                    error = %undo,
                    "failed to undo copy, artifact visible in two directories"
                );
            }
            return Err(MoveError::from_io(e));
        }
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
