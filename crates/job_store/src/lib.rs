//! Job tracking for the asynchronous job plane.
//!
//! Holds the in-memory job store with its status state machine and retention
//! sweeper, plus the consumer that applies worker status updates arriving on
//! the `jobs.status` subject.

pub mod error;
pub mod job;
pub mod status;
pub mod store;

pub use error::{Error, Result};
pub use job::{JobRecord, JobStatus};
pub use status::{JobStatusUpdate, StatusConsumer};
pub use store::JobStore;
