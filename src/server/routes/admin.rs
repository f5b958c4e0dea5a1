//! Admin status
//!
//! Operational counters only; no request text or other payload data.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::server::state::AppState;
use crate::server::types::ApiError;

pub async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<crate::jobs::StatusSnapshot>, ApiError> {
    let manager = Arc::clone(&state.manager);
    let snapshot = tokio::task::spawn_blocking(move || manager.status_snapshot())
        .await
        .map_err(|e| ApiError::from(crate::core::error::ServiceError::internal(e.to_string())))??;
    Ok(Json(snapshot))
}
