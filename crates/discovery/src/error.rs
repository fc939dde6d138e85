//! Error types for service discovery.

use thiserror::Error;

/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Discovery errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Registry address was empty or unusable.
    #[error("registry address is required")]
    MissingAddress,

    /// Transport-level failure talking to the registry.
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The registry answered with a non-success status.
    #[error("registry returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The current snapshot holds no healthy instances.
    #[error("no service instances available")]
    NoInstancesAvailable,
}
