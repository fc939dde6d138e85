//! NATS client with JetStream support for the job pipeline.

pub mod client;

pub use client::{
    NatsClient, StreamConfig, CANCEL_SUBJECT, DEFAULT_MAX_BYTES, DEFAULT_MAX_MESSAGES,
    DEFAULT_RETENTION_SECS, JOBS_STREAM, STATUS_SUBJECT,
};
