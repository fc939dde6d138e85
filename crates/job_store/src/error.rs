//! Error types for the job store.

use crate::job::JobStatus;
use thiserror::Error;

/// Result type alias for job store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Job store errors.
#[derive(Debug, Error)]
pub enum Error {
    /// No record with the given job id.
    #[error("job not found")]
    NotFound,

    /// The requested status change is not a legal state-machine edge.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A status update payload failed to deserialize.
    #[error("malformed status update: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A status update carried a status outside the known vocabulary.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),
}
