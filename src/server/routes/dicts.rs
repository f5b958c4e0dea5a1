//! Dictionary management routes

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::server::state::AppState;
use crate::server::types::{
    ApiError, DictUploadRequest, LearnRequest, OverrideRequest, PromoteRequest,
    PronunciationResponse,
};

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct TextQuery {
    pub text: String,
}

/// List packs with versions and entry counts
pub async fn list_dicts(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = Arc::clone(&state.dict_store);
    let packs = tokio::task::spawn_blocking(move || {
        store.refresh();
        store.list()
    })
    .await
    .unwrap_or_default();
    Json(json!({ "packs": packs }))
}

/// Add or update a pack from a `{name, entries}` body
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DictUploadRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("pack name is required"));
    }
    if name == "auto_learn" {
        return Err(ApiError::bad_request(
            "auto_learn is maintained by the learner",
        ));
    }
    if body.entries.is_empty() {
        return Err(ApiError::bad_request("entries must not be empty"));
    }
    let store = Arc::clone(&state.dict_store);
    let summary = tokio::task::spawn_blocking(move || {
        store.upsert_entries(&name, body.entries.into_iter().collect::<Vec<_>>())
    })
    .await
    .map_err(join_error)??;
    Ok(Json(json!({ "stored": summary })))
}

/// Write model-tagged pack copies into the compiled directory
pub async fn compile(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.dict_store);
    let model_id = state.settings.model_id.clone();
    let compiler_version = state.settings.compiler_version.clone();
    let compiled = tokio::task::spawn_blocking(move || {
        store.refresh();
        store.compile_packs(&model_id, &compiler_version)
    })
    .await
    .map_err(join_error)??;
    let paths: Vec<String> = compiled
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    Ok(Json(json!({ "compiled": paths })))
}

/// Dictionary-only lookup
pub async fn lookup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<PronunciationResponse>, ApiError> {
    let manager = Arc::clone(&state.manager);
    let key = query.key.clone();
    let hit = tokio::task::spawn_blocking(move || {
        manager.resolver().dict_versions(); // refresh packs from disk
        manager.resolver().lookup_key(&key)
    })
    .await
    .map_err(join_error)?;
    match hit {
        Some((phonemes, source_pack)) => Ok(Json(PronunciationResponse {
            key: query.key,
            phonemes,
            source_pack,
        })),
        None => Err(ApiError::not_found("no pronunciation found")),
    }
}

/// Run the fallback phonemizer directly
pub async fn phonemize(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TextQuery>,
) -> Result<Json<Value>, ApiError> {
    let text = query.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::bad_request("text is required"));
    }
    let manager = Arc::clone(&state.manager);
    let learned = tokio::task::spawn_blocking(move || manager.resolver().learn_key(&text))
        .await
        .map_err(join_error)?;
    match learned {
        Ok((phonemes, _)) => Ok(Json(json!({
            "text": query.text.trim(),
            "phonemes": phonemes,
            "backend": "espeak",
            "language": "en-us",
        }))),
        Err(e) => Err(ApiError::bad_request(e.to_string())),
    }
}

/// Resolve a key through the fallback and store it in the auto-learn pack.
/// Modes: default (phonemize the key), `phonemize` (phonemize `text`),
/// `direct` (store the given phonemes).
pub async fn learn(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LearnRequest>,
) -> Result<Json<PronunciationResponse>, ApiError> {
    let key = body.key.trim().to_string();
    if key.is_empty() {
        return Err(ApiError::bad_request("key is required"));
    }
    let manager = Arc::clone(&state.manager);
    let mode = body.mode.unwrap_or_default().to_lowercase();
    let learned = tokio::task::spawn_blocking(move || match mode.as_str() {
        "direct" => {
            let phonemes = body.phonemes.unwrap_or_default();
            manager.resolver().store_phonemes(&key, &phonemes)
        }
        "phonemize" => {
            let text = body.text.unwrap_or_else(|| key.clone());
            let (phonemes, _) = manager.resolver().learn_key(&text)?;
            manager.resolver().store_phonemes(&key, &phonemes)
        }
        _ => manager.resolver().learn_key(&key),
    })
    .await
    .map_err(join_error)?;
    let (phonemes, source_pack) = learned.map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(PronunciationResponse {
        key: body.key.trim().to_string(),
        phonemes,
        source_pack,
    }))
}

/// Upsert one entry into a named pack
pub async fn override_entry(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OverrideRequest>,
) -> Result<Json<PronunciationResponse>, ApiError> {
    let key = body.key.trim().to_string();
    let phonemes = body.phonemes.trim().to_string();
    if key.is_empty() || phonemes.is_empty() {
        return Err(ApiError::bad_request("key and phonemes are required"));
    }
    if body.pack == "auto_learn" {
        return Err(ApiError::bad_request(
            "auto_learn is maintained by the learner",
        ));
    }
    let store = Arc::clone(&state.dict_store);
    let pack = body.pack.clone();
    let entry_key = key.clone();
    let entry_phonemes = phonemes.clone();
    tokio::task::spawn_blocking(move || {
        store.upsert_entries(&pack, vec![(entry_key, entry_phonemes)])
    })
    .await
    .map_err(join_error)??;
    Ok(Json(PronunciationResponse {
        key,
        phonemes,
        source_pack: body.pack,
    }))
}

/// Move a learned pronunciation from `auto_learn` into a durable pack
pub async fn promote(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PromoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let key = body.key.trim().to_string();
    if key.is_empty() {
        return Err(ApiError::bad_request("key is required"));
    }
    if body.target_pack == "auto_learn" {
        return Err(ApiError::bad_request("cannot promote into auto_learn"));
    }
    let manager = Arc::clone(&state.manager);
    let store = Arc::clone(&state.dict_store);
    let target = body.target_pack.clone();
    let overwrite = body.overwrite;
    let promote_key = key.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<String, ApiError> {
        let learner = manager
            .resolver()
            .learner()
            .ok_or_else(|| ApiError::bad_request("auto-learn is disabled"))?;
        let phonemes = learner
            .get(&promote_key)
            .ok_or_else(|| ApiError::not_found("no learned pronunciation found"))?;
        if !overwrite {
            let exists = store
                .get(&target)
                .and_then(|pack| pack.get_fold(&promote_key).map(String::from));
            if exists.is_some() {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    "conflict",
                    "key already exists in target pack",
                ));
            }
        }
        store
            .upsert_entries(&target, vec![(promote_key.clone(), phonemes.clone())])
            .map_err(ApiError::from)?;
        learner.remove(&promote_key);
        Ok(phonemes)
    })
    .await
    .map_err(join_error)?;
    let phonemes = result?;

    Ok(Json(json!({
        "key": key,
        "phonemes": phonemes,
        "source_pack": "auto_learn",
        "target_pack": body.target_pack,
    })))
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    ApiError::from(crate::core::error::ServiceError::internal(e.to_string()))
}
