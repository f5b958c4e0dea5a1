//! Model listing

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::server::state::AppState;
use crate::server::types::ModelInfo;

/// Allowlisted models with their aliases
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = &state.settings;
    let models: Vec<ModelInfo> = settings
        .model_allowlist
        .iter()
        .map(|model_id| {
            let label = if model_id == settings.resolved_default_model() {
                Some("default".to_string())
            } else if model_id == &settings.model_id_quality {
                Some("quality".to_string())
            } else {
                None
            };
            ModelInfo {
                model_id: model_id.clone(),
                label,
            }
        })
        .collect();
    Json(json!({ "models": models }))
}
