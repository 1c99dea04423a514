//! Error taxonomy shared by the chunking overlay and the wrapped backends.
//!
//! Backends report failures with the same enum so that `DirNotFound` and
//! `ObjectNotFound` propagate through the overlay unchanged.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("invalid chunk name pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("incorrect upload size {actual} != {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("incorrect chunks size {actual} != {expected}")]
    ChunkSizeMismatch { expected: u64, actual: u64 },
    #[error("destination ignored {0} data bytes")]
    IgnoredBytes(u64),
    #[error("directory `{0}` not found")]
    DirNotFound(String),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid composite object `{remote}`: {reason}")]
    InvalidComposite { remote: String, reason: String },
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("metadata version {0} is not supported, please upgrade")]
    MetaVersionUnsupported(i64),
    #[error("chunk overlap with `{0}`")]
    ChunkOverlap(String),
    #[error("chunk number overflow")]
    ChunkOverflow,
    #[error("can't copy `{0}` server-side")]
    CantCopy(String),
    #[error("can't move `{0}` server-side")]
    CantMove(String),
    #[error("wrapped backend does not support {0}")]
    Unsupported(&'static str),
    #[error("can't set up transaction for `{0}`")]
    Transaction(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ChunkerResult<T> = Result<T, ChunkerError>;

impl ChunkerError {
    /// Shortcut for an invalid composite with a formatted reason.
    pub fn invalid_composite(remote: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidComposite {
            remote: remote.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_) | Self::DirNotFound(_))
    }

    /// True when the caller should fall back to a generic read and rewrite.
    pub fn is_server_side_refusal(&self) -> bool {
        matches!(self, Self::CantCopy(_) | Self::CantMove(_))
    }
}

impl From<ChunkerError> for io::Error {
    fn from(err: ChunkerError) -> Self {
        match err {
            ChunkerError::Io(err) => err,
            ChunkerError::ObjectNotFound(_) | ChunkerError::DirNotFound(_) => {
                io::Error::new(io::ErrorKind::NotFound, err)
            }
            other => io::Error::other(other),
        }
    }
}
