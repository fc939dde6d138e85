//! NATS client implementation with JetStream support.
//!
//! Job submissions go through the durable `JOBS` stream so workers can be
//! offline without losing messages; cancellations and other fire-and-forget
//! notifications use core NATS.

use anyhow::Result;
use async_nats::jetstream::consumer::{pull, PullConsumer};
use async_nats::jetstream::{self, stream::Stream};
use async_nats::{Client, Event, Subscriber};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Durable stream holding job traffic.
pub const JOBS_STREAM: &str = "JOBS";

/// Subject pattern captured by the jobs stream.
pub const JOBS_SUBJECTS: &str = "jobs.*";

/// Subject workers publish status updates on.
pub const STATUS_SUBJECT: &str = "jobs.status";

/// Best-effort subject for cancellation notifications.
pub const CANCEL_SUBJECT: &str = "jobs.cancel";

/// Default retention period for streams (24 hours).
pub const DEFAULT_RETENTION_SECS: u64 = 86_400;

/// Default max messages per stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 1_000_000;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Ceiling for the reconnect back-off.
const MAX_RECONNECT_DELAY_MS: u64 = 2_000;

/// Configuration for creating a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns to capture.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum number of messages.
    pub max_messages: i64,
    /// Maximum bytes.
    pub max_bytes: i64,
}

impl StreamConfig {
    /// Config for the jobs stream: captures `jobs.*` with bounded retention.
    pub fn jobs() -> Self {
        Self {
            name: JOBS_STREAM.to_string(),
            subjects: vec![JOBS_SUBJECTS.to_string()],
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    /// Set retention period in seconds.
    pub fn with_retention(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Replace the subject patterns.
    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }
}

/// Wrapper around the NATS client with a JetStream context.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to a NATS server and create a JetStream context.
    ///
    /// Reconnection is unlimited with an exponential delay capped at 2 s;
    /// connection state changes are logged.
    pub async fn connect(url: &str, client_name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::ConnectOptions::new()
            .name(client_name)
            .reconnect_delay_callback(|attempts| {
                let backoff = 250u64.saturating_mul(1u64 << attempts.min(8) as u32);
                Duration::from_millis(backoff.min(MAX_RECONNECT_DELAY_MS))
            })
            .event_callback(|event| async move {
                match event {
                    Event::Disconnected => warn!("Disconnected from NATS"),
                    Event::Connected => info!("Connected to NATS server"),
                    other => debug!("NATS client event: {}", other),
                }
            })
            .connect(url)
            .await?;

        let jetstream = jetstream::new(client.clone());

        Ok(Self { client, jetstream })
    }

    /// Subscribe to a subject pattern using NATS Core (low-latency push).
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject pattern: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(subscriber)
    }

    /// Create or get a stream with the given configuration.
    pub async fn ensure_stream(&self, config: &StreamConfig) -> Result<Stream> {
        info!(
            "Ensuring stream '{}' exists (subjects: {:?}, retention: {}s)",
            config.name, config.subjects, config.max_age_secs
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.name.clone(),
                description: Some("Stream for job processing".to_string()),
                subjects: config.subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_messages: config.max_messages,
                max_bytes: config.max_bytes,
                max_age: Duration::from_secs(config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", config.name);
        Ok(stream)
    }

    /// Publish a message to JetStream and wait for the server ack.
    /// Returns the acknowledged stream sequence.
    pub async fn publish_to_stream(
        &self,
        subject: impl Into<String>,
        payload: bytes::Bytes,
    ) -> Result<u64> {
        let ack = self.jetstream.publish(subject.into(), payload).await?.await?;
        Ok(ack.sequence)
    }

    /// Publish a message using NATS Core (fire-and-forget, lowest latency).
    pub async fn publish_fast(&self, subject: &str, payload: bytes::Bytes) -> Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    /// Get or create a durable pull consumer on a stream, filtered to one
    /// subject. Durable consumers survive reconnects; unacknowledged
    /// messages are redelivered.
    pub async fn durable_pull_consumer(
        &self,
        stream_name: &str,
        consumer_name: &str,
        filter_subject: &str,
    ) -> Result<PullConsumer> {
        let stream = self.jetstream.get_stream(stream_name).await?;
        let consumer = stream
            .get_or_create_consumer(
                consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    filter_subject: filter_subject.to_string(),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            "Durable consumer '{}' ready on stream '{}' (filter: {})",
            consumer_name, stream_name, filter_subject
        );
        Ok(consumer)
    }

    /// Flush buffered messages and drain the connection. Called during
    /// graceful shutdown so in-flight publishes are delivered.
    pub async fn drain(&self) -> Result<()> {
        self.client.flush().await?;
        self.client.drain().await?;
        Ok(())
    }

    /// Get the underlying JetStream context.
    pub fn context(&self) -> &jetstream::Context {
        &self.jetstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_stream_config_defaults() {
        let config = StreamConfig::jobs();
        assert_eq!(config.name, "JOBS");
        assert_eq!(config.subjects, vec!["jobs.*".to_string()]);
        assert_eq!(config.max_age_secs, DEFAULT_RETENTION_SECS);
    }

    #[test]
    fn test_stream_config_builders() {
        let config = StreamConfig::jobs()
            .with_retention(3600)
            .with_subjects(vec!["jobs.>".to_string()]);
        assert_eq!(config.max_age_secs, 3600);
        assert_eq!(config.subjects, vec!["jobs.>".to_string()]);
    }

    #[test]
    fn test_status_subject_is_captured_by_stream() {
        // The status consumer filters within the jobs stream, so the wildcard
        // must cover it.
        assert!(STATUS_SUBJECT.starts_with("jobs."));
        assert_eq!(STATUS_SUBJECT.matches('.').count(), 1);
    }
}
