//! Collision-safe atomic moves between spool directories.
//!
//! A move either places the complete file under a free name in the
//! destination directory, or leaves the source where it was. Existing files
//! are never overwritten: a name clash picks `<stem>-dupN.<ext>` instead.

mod mover;
mod naming;
mod ops;

pub use mover::{CollisionSafeMover, MoveConfig, Placement, RetryBudget};
pub use naming::{collision_name, logical_name};
pub use ops::{FileOps, StdFileOps};

/// Errors produced by a move.
#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    /// A single attempt failed for a reason that may clear up on its own.
    #[error("transient move failure: {0}")]
    Transient(#[source] std::io::Error),

    /// The move cannot complete, either by nature or after exhausting retries.
    #[error("move failed after {attempts} attempt(s): {reason}")]
    Permanent { attempts: u32, reason: String },

    /// Every candidate destination name is taken.
    #[error("no free destination name for {name} after {attempts} collision attempt(s)")]
    CollisionExhausted { name: String, attempts: u32 },
}

impl MoveError {
    /// Classifies an I/O error from a single move attempt.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::InvalidInput | ErrorKind::Unsupported => {
                Self::Permanent {
                    attempts: 1,
                    reason: err.to_string(),
                }
            }
            _ => Self::Transient(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    fn is_transient(kind: ErrorKind) -> bool {
        matches!(MoveError::from_io(Error::from(kind)), MoveError::Transient(_))
    }

    #[test]
    fn io_classification() {
        assert!(!is_transient(ErrorKind::NotFound));
        assert!(!is_transient(ErrorKind::InvalidInput));
        assert!(is_transient(ErrorKind::PermissionDenied));
        assert!(is_transient(ErrorKind::Interrupted));
        assert!(is_transient(ErrorKind::TimedOut));
        assert!(is_transient(ErrorKind::AlreadyExists));
    }

    #[test]
    fn error_messages() {
        let err = MoveError::CollisionExhausted {
            name: "trace1.pcap".into(),
            attempts: 5,
        };
        assert!(err.to_string().contains("trace1.pcap"));
        let err = MoveError::Permanent {
            attempts: 4,
            reason: "busy".into(),
        };
        assert_eq!(err.to_string(), "move failed after 4 attempt(s): busy");
    }
}
