//! Prometheus-style metrics exposition

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::core::metrics_export::PrometheusExporter;
use crate::server::state::AppState;

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let manager = Arc::clone(&state.manager);
    let body = tokio::task::spawn_blocking(move || {
        let snapshot = manager.metrics().snapshot();
        let queue_len = manager.backend().queue_len().unwrap_or(0);
        let workers_online = manager.backend().workers_online().unwrap_or(0);
        let active_jobs = manager.backend().active_jobs().unwrap_or(0);
        PrometheusExporter::new().export(&snapshot, queue_len, workers_online, active_jobs)
    })
    .await
    .unwrap_or_default();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
