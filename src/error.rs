// THEORY:
// Every fallible operation in the engine reports through a single error enum.
// The variants mirror the four failure classes the pipeline distinguishes:
// configuration problems caught before a run starts, missing input data that
// makes classification meaningless, storage failures on the output side, and
// internal invariant violations that point at a programming error. Only the
// storage class is retried (see `parallel_pipeline`); everything else aborts
// the run and is surfaced to the binary, which wraps it with `anyhow` context.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EraserError>;

#[derive(Error, Debug)]
pub enum EraserError {
    /// A threshold, path or classifier selection is invalid. Raised before any frame is touched.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A frame has no temporal neighbor to compare against.
    #[error("frame {index} has no neighboring frame (sequence length {len})")]
    MissingNeighbor { index: usize, len: usize },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("internal error: {0}")]
    Internal(#[from] InternalError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Invariant violations. These indicate a mismatch between components, never bad input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InternalError {
    #[error("outlier at {x},{y} is untagged after labeling")]
    UntaggedOutlier { x: u32, y: u32 },

    #[error("classifier references unknown feature `{0}`")]
    UnknownFeature(String),

    #[error("frame {index} cannot move from {from} back to {to}")]
    BackwardTransition {
        index: usize,
        from: String,
        to: String,
    },

    #[error("pipeline channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("frame {0} was never delivered to the final processing window")]
    FrameNeverArrived(usize),

    #[error("frame {index} reached finalization while frame {expected} was still pending")]
    FinalizedOutOfOrder { index: usize, expected: usize },

    #[error("pipeline task failed: {0}")]
    TaskFailed(String),

    #[error("group {group} of frame {frame} already has a paint decision")]
    DecisionCommittedTwice { frame: usize, group: String },
}

impl EraserError {
    /// Storage errors are the only class worth a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EraserError::Write { .. } | EraserError::Io(_))
    }
}
