//! REST handlers for the `/v1/*` route table.

use super::ApiState;
use crate::error::AuditError;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

impl IntoResponse for AuditError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitAuditRequest {
    pub url: String,
    #[serde(default)]
    pub no_cache: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitAuditResponse {
    pub job_id: String,
    pub status: crate::model::JobStatus,
    pub queue_position: Option<i64>,
}

pub async fn submit_audit(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<SubmitAuditRequest>,
) -> Result<Json<SubmitAuditResponse>, AuditError> {
    let outcome = state
        .dispatcher
        .submit(&request.url, &addr.ip().to_string(), request.no_cache)
        .await?;

    Ok(Json(SubmitAuditResponse {
        job_id: outcome.job_id,
        status: outcome.status,
        queue_position: outcome.queue_position,
    }))
}

pub async fn get_audit(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<crate::model::Job>, AuditError> {
    state
        .dispatcher
        .job(&job_id)
        .map(Json)
        .ok_or_else(|| AuditError::ValidationFailed(format!("unknown job {job_id}")))
}

pub async fn cancel_audit(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, AuditError> {
    state.dispatcher.cancel(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_running(State(state): State<ApiState>) -> Json<Vec<crate::model::Job>> {
    Json(state.dispatcher.list_running())
}

pub async fn audit_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "jobs": state.dispatcher.stats(),
        "concurrency": state.dispatcher.limiter_stats(),
    }))
}

pub async fn cache_stats(State(state): State<ApiState>) -> Result<Json<crate::cache::CacheStats>, AuditError> {
    state
        .cache
        .stats()
        .await
        .map(Json)
        .map_err(AuditError::Internal)
}

pub async fn cache_cleanup(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, AuditError> {
    let removed = state.cache.cleanup_expired().await.map_err(AuditError::Internal)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

pub async fn cache_clear(State(state): State<ApiState>) -> Result<StatusCode, AuditError> {
    state.cache.clear().await.map_err(AuditError::Internal)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let cache_health = state.cache.health().await;
    Json(serde_json::json!({
        "status": "ok",
        "cache": cache_health,
    }))
}
