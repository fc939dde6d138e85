//! Admin-only handlers.

use crate::error::ApiError;
use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use job_store::JobStatus;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct AdminStatsResponse {
    pub total_jobs: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Services with an active load balancer.
    pub proxied_services: Vec<String>,
    /// Distinct rate-limited clients currently tracked.
    pub rate_limit_clients: usize,
}

/// GET /api/v1/admin-stats
pub async fn admin_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AdminStatsResponse>, ApiError> {
    let mut proxied_services = state.proxy.services();
    proxied_services.sort();

    Ok(Json(AdminStatsResponse {
        total_jobs: state.store.count(),
        queued: state.store.list_by_status(JobStatus::Queued).len(),
        processing: state.store.list_by_status(JobStatus::Processing).len(),
        completed: state.store.list_by_status(JobStatus::Completed).len(),
        failed: state.store.list_by_status(JobStatus::Failed).len(),
        cancelled: state.store.list_by_status(JobStatus::Cancelled).len(),
        proxied_services,
        rate_limit_clients: state.limiter.len(),
    }))
}

/// GET /admin/
pub async fn dashboard() -> Json<serde_json::Value> {
    Json(serde_json::json!({"message": "Admin dashboard"}))
}
