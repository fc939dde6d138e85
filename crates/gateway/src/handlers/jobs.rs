//! Job submission, status, cancellation, and listing handlers.
//!
//! Submissions are persisted in the job store and published onto the durable
//! jobs stream keyed by type (`jobs.ai_training`, `jobs.inference`, ...), so
//! workers can specialize per subject. Cancellations go out best-effort on
//! `jobs.cancel`.

use crate::auth::Principal;
use crate::error::ApiError;
use crate::routes::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use job_store::{Error as JobStoreError, JobRecord, JobStatus};
use nats_client::CANCEL_SUBJECT;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Client request to submit a job.
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    /// Job type, e.g. `ai_training`, `data_processing`, `inference`.
    #[serde(rename = "type")]
    pub job_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// GPU model to target, e.g. `A100`, `H100`, `L4`, or `any`.
    pub gpu_type: String,
    pub gpu_count: u32,
    #[serde(default)]
    pub priority: i32,
    pub params: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Response envelope for job operations.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Message published to the jobs stream for workers.
#[derive(Debug, Serialize)]
pub struct JobMessage {
    pub job_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub priority: i32,
    pub params: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Cancellation notification for workers.
#[derive(Debug, Serialize)]
struct CancelMessage {
    job_id: String,
    timestamp: DateTime<Utc>,
}

/// POST /api/v1/jobs
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<JobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    // Invalid jobs would waste worker capacity; reject them here.
    if req.job_type.is_empty() {
        return Err(ApiError::BadRequest("Job type is required".to_string()));
    }
    if req.job_type.contains(['.', ' ', '*', '>']) {
        // The type becomes a subject token; keep the hierarchy well-formed.
        return Err(ApiError::BadRequest("Invalid job type".to_string()));
    }
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("Job name is required".to_string()));
    }
    if req.gpu_count < 1 {
        return Err(ApiError::BadRequest(
            "GPU count must be at least 1".to_string(),
        ));
    }

    let job_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    state.store.add(
        JobRecord::new(&job_id, &principal.user_id, &req.job_type, &req.name)
            .with_message("Job submitted successfully"),
    );

    let job_msg = JobMessage {
        job_id: job_id.clone(),
        user_id: principal.user_id,
        job_type: req.job_type.clone(),
        name: req.name,
        description: req.description,
        gpu_type: req.gpu_type.clone(),
        gpu_count: req.gpu_count,
        priority: req.priority,
        params: req.params,
        tags: req.tags,
        timestamp: now,
    };

    let subject = format!("jobs.{}", req.job_type);
    let payload = serde_json::to_vec(&job_msg)
        .map_err(|e| ApiError::Internal(format!("failed to serialize job message: {}", e)))?;

    match state.nats.publish_to_stream(subject, payload.into()).await {
        Ok(sequence) => {
            info!(
                "job submitted: id={} type={} gpu={} count={} seq={}",
                job_id, req.job_type, req.gpu_type, req.gpu_count, sequence
            );
        }
        Err(e) => {
            return Err(ApiError::Internal(format!(
                "failed to publish job message: {}",
                e
            )));
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(JobResponse {
            job_id,
            status: JobStatus::Queued.to_string(),
            timestamp: now,
            message: "Job submitted successfully".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}
pub async fn get_job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .store
        .get(&job_id)
        .map_err(|_| ApiError::NotFound("Job not found".to_string()))?;

    Ok(Json(JobResponse {
        job_id: job.job_id,
        status: job.status.to_string(),
        timestamp: Utc::now(),
        message: job.message,
    }))
}

/// DELETE /api/v1/jobs/{job_id}
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    match state
        .store
        .update_status(&job_id, JobStatus::Cancelled, "Job cancellation requested")
    {
        Ok(()) => {}
        Err(JobStoreError::NotFound) => {
            return Err(ApiError::NotFound("Job not found".to_string()));
        }
        Err(e @ JobStoreError::InvalidTransition { .. }) => {
            return Err(ApiError::Conflict(e.to_string()));
        }
        Err(e) => {
            return Err(ApiError::Internal(format!("failed to cancel job: {}", e)));
        }
    }

    let cancel_msg = CancelMessage {
        job_id: job_id.clone(),
        timestamp: Utc::now(),
    };
    let payload = serde_json::to_vec(&cancel_msg)
        .map_err(|e| ApiError::Internal(format!("failed to serialize cancel message: {}", e)))?;

    // Best-effort notification; workers subscribed to jobs.cancel abort
    // matching in-flight work.
    if let Err(e) = state.nats.publish_fast(CANCEL_SUBJECT, payload.into()).await {
        error!("failed to publish job cancellation message: {}", e);
        return Err(ApiError::Internal(format!(
            "failed to publish cancellation: {}",
            e
        )));
    }

    info!("job cancellation requested: id={}", job_id);

    Ok(Json(JobResponse {
        job_id,
        status: JobStatus::Cancelled.to_string(),
        timestamp: Utc::now(),
        message: "Job cancellation requested".to_string(),
    }))
}

/// GET /api/v1/jobs — jobs belonging to the authenticated user.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Json<Vec<JobResponse>> {
    let responses = state
        .store
        .list_by_owner(&principal.user_id)
        .into_iter()
        .map(|job| JobResponse {
            job_id: job.job_id,
            status: job.status.to_string(),
            timestamp: job.submitted_at,
            message: job.message,
        })
        .collect();

    Json(responses)
}

/// GET /api/v1/jobs/status/{status} — all jobs in a status, admin only.
pub async fn list_jobs_by_status(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(status): Path<String>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    if principal.role != "admin" {
        return Err(ApiError::Forbidden);
    }

    let status: JobStatus = status
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Unknown job status: {}", status)))?;

    let responses = state
        .store
        .list_by_status(status)
        .into_iter()
        .map(|job| JobResponse {
            job_id: job.job_id,
            status: job.status.to_string(),
            timestamp: job.submitted_at,
            message: job.message,
        })
        .collect();

    Ok(Json(responses))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_request_deserialization() {
        let body = r#"{
            "type": "ai_training",
            "name": "t",
            "gpu_type": "A100",
            "gpu_count": 1,
            "params": {}
        }"#;
        let req: JobRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.job_type, "ai_training");
        assert_eq!(req.gpu_count, 1);
        assert_eq!(req.priority, 0);
        assert!(req.tags.is_empty());
    }

    #[test]
    fn test_job_message_wire_format() {
        let msg = JobMessage {
            job_id: "j1".to_string(),
            user_id: "u1".to_string(),
            job_type: "inference".to_string(),
            name: "n".to_string(),
            description: String::new(),
            gpu_type: "L4".to_string(),
            gpu_count: 2,
            priority: 5,
            params: serde_json::json!({"model": "llama"}),
            tags: vec![],
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "inference");
        assert_eq!(json["gpu_count"], 2);
        // Empty optionals stay off the wire.
        assert!(json.get("description").is_none());
        assert!(json.get("tags").is_none());
    }

    #[test]
    fn test_job_response_skips_empty_message() {
        let response = JobResponse {
            job_id: "j1".to_string(),
            status: "queued".to_string(),
            timestamp: Utc::now(),
            message: String::new(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("message").is_none());
    }
}
