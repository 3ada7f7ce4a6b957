//! HTTP/WebSocket transport (§4.12, §6 route table).
//!
//! Router construction follows the orchestrator API's shape: a plain state
//! struct implementing `Clone` (all fields already `Arc`-wrapped), passed via
//! `with_state`, with routes grouped by concern rather than one flat list.

mod routes;
mod ws;

use crate::cache::TtlCache;
use crate::dispatcher::Dispatcher;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub cache: Arc<TtlCache>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/audit", post(routes::submit_audit))
        .route("/v1/audit/{id}", get(routes::get_audit))
        .route("/v1/audit/{id}", delete(routes::cancel_audit))
        .route("/v1/audit/{id}/ws", get(ws::audit_progress_ws))
        .route("/v1/audits/running", get(routes::list_running))
        .route("/v1/audits/stats", get(routes::audit_stats))
        .route("/v1/cache/stats", get(routes::cache_stats))
        .route("/v1/cache/cleanup", post(routes::cache_cleanup))
        .route("/v1/cache", delete(routes::cache_clear))
        .route("/v1/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
