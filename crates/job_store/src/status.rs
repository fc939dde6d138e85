//! Worker status-update consumer.
//!
//! Subscribes durably to `jobs.status` and applies each update to the job
//! store. Delivery is at-least-once: updates the state machine rejects (or
//! that fail to parse) are logged and acknowledged since redelivery cannot
//! fix them; only a panicking handler NAKs the message for redelivery.

use crate::error::{Error, Result};
use crate::job::JobStatus;
use crate::store::JobStore;
use async_nats::jetstream::AckKind;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use nats_client::{NatsClient, JOBS_STREAM, STATUS_SUBJECT};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Durable consumer name; survives gateway restarts and reconnects.
const CONSUMER_NAME: &str = "gateway-status";

/// Status update published by a worker.
#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusUpdate {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    /// 0-100 percent; informational only.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Consumes `jobs.status` and drives the job store.
///
/// Constructed after both the store and the NATS client exist, which keeps
/// the store↔broker wiring acyclic.
pub struct StatusConsumer {
    store: JobStore,
    nats: NatsClient,
    shutdown_rx: mpsc::Receiver<()>,
}

impl StatusConsumer {
    pub fn new(store: JobStore, nats: NatsClient, shutdown_rx: mpsc::Receiver<()>) -> Self {
        Self {
            store,
            nats,
            shutdown_rx,
        }
    }

    /// Run the consumer loop until shutdown.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let consumer = self
            .nats
            .durable_pull_consumer(JOBS_STREAM, CONSUMER_NAME, STATUS_SUBJECT)
            .await?;
        let mut messages = consumer.messages().await?;

        info!("status consumer running, filter '{}'", STATUS_SUBJECT);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("status consumer received shutdown signal");
                    break;
                }

                msg = messages.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            let store = self.store.clone();
                            let payload = msg.payload.clone();

                            // Isolate the handler so a panic cannot take the
                            // consumer loop down with it.
                            let outcome = tokio::spawn(async move {
                                apply_status_update(&store, &payload)
                            })
                            .await;

                            match outcome {
                                Ok(Ok(())) => {
                                    if let Err(e) = msg.ack().await {
                                        warn!("failed to ack status update: {}", e);
                                    }
                                }
                                Ok(Err(e)) => {
                                    warn!("dropping status update: {}", e);
                                    if let Err(e) = msg.ack().await {
                                        warn!("failed to ack dropped update: {}", e);
                                    }
                                }
                                Err(join_err) => {
                                    error!("status handler panicked: {}", join_err);
                                    if let Err(e) = msg.ack_with(AckKind::Nak(None)).await {
                                        warn!("failed to nack status update: {}", e);
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("status subscription error: {}", e);
                        }
                        None => {
                            warn!("status subscription ended unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        info!("status consumer stopped");
        Ok(())
    }
}

/// Parse one status-update payload and apply it to the store.
fn apply_status_update(store: &JobStore, payload: &[u8]) -> Result<()> {
    let update: JobStatusUpdate = serde_json::from_slice(payload)?;

    let status: JobStatus = update.status.parse()?;
    let message = update.message.unwrap_or_default();

    store.update_status_with(
        &update.job_id,
        status,
        &message,
        update.started_at,
        update.ended_at,
    )?;

    info!("updated job status: id={} status={}", update.job_id, status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRecord;
    use chrono::Duration;

    fn store_with_job(id: &str) -> JobStore {
        let store = JobStore::new(100, Duration::hours(24));
        store.add(JobRecord::new(id, "user-1", "ai_training", "t"));
        store
    }

    #[test]
    fn test_processing_update_sets_started_at() {
        let store = store_with_job("job-1");
        let payload = br#"{"job_id":"job-1","status":"processing"}"#;

        apply_status_update(&store, payload).unwrap();

        let job = store.get("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_completed_then_processing_is_rejected() {
        let store = store_with_job("job-1");
        apply_status_update(&store, br#"{"job_id":"job-1","status":"processing"}"#).unwrap();
        apply_status_update(
            &store,
            br#"{"job_id":"job-1","status":"completed","message":"done"}"#,
        )
        .unwrap();

        let err = apply_status_update(&store, br#"{"job_id":"job-1","status":"processing"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(store.get("job-1").unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_unknown_status_is_dropped() {
        let store = store_with_job("job-1");
        let err = apply_status_update(&store, br#"{"job_id":"job-1","status":"warming-up"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownStatus(_)));
        assert_eq!(store.get("job-1").unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let store = store_with_job("job-1");
        assert!(matches!(
            apply_status_update(&store, b"not json"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_job_id() {
        let store = store_with_job("job-1");
        let err = apply_status_update(&store, br#"{"job_id":"ghost","status":"processing"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn test_worker_reported_timestamps_applied() {
        let store = store_with_job("job-1");
        let payload = br#"{
            "job_id": "job-1",
            "status": "processing",
            "started_at": "2024-05-01T10:00:00Z",
            "progress": 12.5
        }"#;

        apply_status_update(&store, payload).unwrap();

        let job = store.get("job-1").unwrap();
        assert_eq!(
            job.started_at.unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
    }
}
