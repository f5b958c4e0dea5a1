//! Reader contract
//!
//! One-call entry point for reading clients: submits the job and returns
//! the playback URL triple (proxy, backend, best) for the job, playlist,
//! and merged audio.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::server::state::AppState;
use crate::server::types::{ApiError, TtsJobRequest};
use crate::text::ReadingProfile;

use super::tts::admit;

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderRequest {
    pub text: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_true")]
    pub prefer_phonemes: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub reading_profile: Option<ReadingProfile>,
}

fn default_mode() -> String {
    "segments".to_string()
}

fn default_true() -> bool {
    true
}

/// Behind a proxy (or a non-local origin) the proxied URLs are the ones the
/// client can actually reach
pub(crate) fn prefer_proxy_from_headers(headers: &HeaderMap) -> bool {
    if headers.contains_key("x-forwarded-host") || headers.contains_key("x-forwarded-proto") {
        return true;
    }
    headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(|origin| !origin.is_empty() && !origin.contains(":8080"))
        .unwrap_or(false)
}

pub(crate) fn select_best_url(url_proxy: &str, url_backend: &str, prefer_proxy: bool) -> String {
    if prefer_proxy {
        url_proxy.to_string()
    } else {
        url_backend.to_string()
    }
}

/// `POST /v1/reader/synthesize`
pub async fn synthesize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ReaderRequest>,
) -> Result<Json<Value>, ApiError> {
    if !matches!(body.mode.as_str(), "segments" | "merged") {
        return Err(ApiError::bad_request("mode must be one of: merged, segments"));
    }

    let job = admit(
        &state,
        &headers,
        TtsJobRequest {
            text: body.text,
            model_id: body.model_id,
            model: body.model,
            voice_id: body.voice_id,
            reading_profile: body.reading_profile,
            prefer_phonemes: body.prefer_phonemes,
        },
    )
    .await?;

    let job_id = job.job_id.clone();
    let prefer_proxy = prefer_proxy_from_headers(&headers);
    let mut response = Map::new();
    response.insert("job_id".to_string(), json!(job_id));
    response.insert("status".to_string(), json!(job.status));

    let triples = [
        ("job_url", format!("/v1/tts/jobs/{}", job_id)),
        ("playlist_url", format!("/v1/tts/jobs/{}/playlist.json", job_id)),
        (
            "merged_audio_url",
            format!("/v1/tts/jobs/{}/audio.ogg", job_id),
        ),
    ];
    for (name, backend_url) in triples {
        let proxy_url = backend_url.replacen("/v1/tts", "/api/tts", 1);
        let best = select_best_url(&proxy_url, &backend_url, prefer_proxy);
        response.insert(format!("{}_proxy", name), json!(proxy_url));
        response.insert(format!("{}_backend", name), json!(backend_url));
        response.insert(format!("{}_best", name), json!(best.clone()));
        // Convenience aliases pointing at the best choice
        response.insert(name.to_string(), json!(best));
    }

    Ok(Json(Value::Object(response)))
}
