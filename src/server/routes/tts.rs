//! Job submission and playback routes

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::core::error::ServiceError;
use crate::jobs::{merge, JobRecord, JobRequest, SegmentStatus};
use crate::server::middleware::client_key;
use crate::server::state::AppState;
use crate::server::types::{
    ApiError, JobEnvelope, PlaylistEntry, PlaylistResponse, ProgressResponse, TtsJobRequest,
};

use super::reader::{prefer_proxy_from_headers, select_best_url};

/// Most compatible Content-Type for browser audio playback
pub const OGG_MEDIA_TYPE: &str = "audio/ogg";

/// Hint for clients polling a non-ready playlist entry
const SEGMENT_RETRY_AFTER_MS: u64 = 500;

/// Resolve the `model` alias ("default" / "quality") against settings
pub(crate) fn resolve_model_id(
    model: Option<&str>,
    model_id: Option<&str>,
    state: &AppState,
) -> String {
    match model {
        Some("default") => state.settings.resolved_default_model().to_string(),
        Some("quality") => state.settings.model_id_quality.clone(),
        Some(other) => other.to_string(),
        None => model_id
            .map(str::to_string)
            .unwrap_or_else(|| state.settings.model_id.clone()),
    }
}

pub(crate) fn build_job_request(body: TtsJobRequest, state: &AppState) -> JobRequest {
    let model_id = resolve_model_id(body.model.as_deref(), body.model_id.as_deref(), state);
    JobRequest {
        text: body.text,
        model_id,
        voice_id: body.voice_id,
        reading_profile: body.reading_profile.unwrap_or_default(),
        prefer_phonemes: body.prefer_phonemes,
    }
}

/// Run admission, mapping rate limiting and errors onto HTTP statuses
pub(crate) async fn admit(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: TtsJobRequest,
) -> Result<JobRecord, ApiError> {
    if !state.rate_limiter.check(&client_key(headers)) {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "admission.rate_limited",
            "per-client rate limit exceeded",
        ));
    }
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request = build_job_request(body, state);
    let manager = Arc::clone(&state.manager);
    tokio::task::spawn_blocking(move || manager.submit(request, idempotency_key.as_deref()))
        .await
        .map_err(join_error)?
        .map_err(ApiError::from)
}

/// `POST /v1/tts/jobs`
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TtsJobRequest>,
) -> Result<Json<JobEnvelope>, ApiError> {
    let job = admit(&state, &headers, body).await?;
    Ok(Json(JobEnvelope {
        job_id: job.job_id.clone(),
        manifest: job.into(),
    }))
}

/// `GET /v1/tts/jobs/{job_id}`
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobEnvelope>, ApiError> {
    let job = fetch_job(&state, &job_id).await?;
    Ok(Json(JobEnvelope {
        job_id,
        manifest: job.into(),
    }))
}

/// `POST /v1/tts/jobs/{job_id}/cancel`
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = Arc::clone(&state.manager);
    let canceled_id = job_id.clone();
    let job = tokio::task::spawn_blocking(move || manager.cancel(&canceled_id))
        .await
        .map_err(join_error)??;
    let job = job.ok_or_else(|| ApiError::not_found("job not found"))?;
    Ok(Json(json!({"job_id": job_id, "status": job.status})))
}

/// `GET /v1/tts/jobs/{job_id}/segments/{segment_id}`
pub async fn get_segment(
    State(state): State<Arc<AppState>>,
    Path((job_id, segment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let job = fetch_job(&state, &job_id).await?;
    let segment = job
        .segment(&segment_id)
        .ok_or_else(|| ApiError::not_found("segment not found"))?;

    let Some(path) = segment.path.as_ref().filter(|_| {
        segment.status == SegmentStatus::Ready
    }) else {
        // Known but not synthesized yet
        return Ok((
            StatusCode::ACCEPTED,
            [(header::RETRY_AFTER, "1")],
            Json(json!({"detail": "segment not ready", "status": segment.status})),
        )
            .into_response());
    };

    let mut extra = vec![(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("inline; filename=\"{}.ogg\"", segment_id))
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
    )];
    // Content-addressed audio never changes: aggressive caching + ETag
    extra.push((
        header::ETAG,
        HeaderValue::from_str(&format!("\"{}\"", segment.cache_key))
            .unwrap_or(HeaderValue::from_static("\"\"")),
    ));
    extra.push((
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    ));

    Ok(
        crate::server::files::serve_file(
            std::path::Path::new(path),
            OGG_MEDIA_TYPE,
            &headers,
            extra,
        )
        .await,
    )
}

/// `GET /v1/tts/jobs/{job_id}/playlist.json`
pub async fn get_playlist(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PlaylistResponse>, ApiError> {
    let job = fetch_job(&state, &job_id).await?;
    let prefer_proxy = prefer_proxy_from_headers(&headers);
    let mut segments: Vec<_> = job.segments.iter().collect();
    segments.sort_by_key(|s| s.index);

    let playlist = segments
        .into_iter()
        .map(|segment| {
            let url_backend = format!(
                "/v1/tts/jobs/{}/segments/{}",
                job_id, segment.segment_id
            );
            let url_proxy = format!(
                "/api/tts/jobs/{}/segments/{}",
                job_id, segment.segment_id
            );
            let ready = segment.status == SegmentStatus::Ready;
            let polling = !ready && segment.status != SegmentStatus::Error;
            PlaylistEntry {
                index: segment.index,
                segment_id: segment.segment_id.clone(),
                status: status_name(segment.status),
                ready,
                url_best: select_best_url(&url_proxy, &url_backend, prefer_proxy),
                url_proxy,
                url_backend,
                retry_after_ms: polling.then_some(SEGMENT_RETRY_AFTER_MS),
            }
        })
        .collect();

    Ok(Json(PlaylistResponse { job_id, playlist }))
}

/// `GET /v1/tts/jobs/{job_id}/audio.ogg`
pub async fn get_merged_audio(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let job = fetch_job(&state, &job_id).await?;

    if !job.status.is_terminal_complete() {
        let progress = job.progress();
        return Ok((
            StatusCode::ACCEPTED,
            [(header::RETRY_AFTER, "1")],
            Json(ProgressResponse {
                job_id,
                status: status_label(&job),
                progress,
            }),
        )
            .into_response());
    }

    let manager = Arc::clone(&state.manager);
    let merge_job = job.clone();
    let merged = tokio::task::spawn_blocking(move || merge::ensure_merged(&manager, &merge_job))
        .await
        .map_err(join_error)??;

    let extra = vec![(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("inline; filename=\"job_{}.ogg\"", job_id))
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
    )];
    Ok(crate::server::files::serve_file(&merged, OGG_MEDIA_TYPE, &headers, extra).await)
}

pub(crate) async fn fetch_job(state: &Arc<AppState>, job_id: &str) -> Result<JobRecord, ApiError> {
    let manager = Arc::clone(&state.manager);
    let id = job_id.to_string();
    tokio::task::spawn_blocking(move || manager.get_job(&id))
        .await
        .map_err(join_error)??
        .ok_or_else(|| ApiError::not_found("job not found"))
}

fn status_name(status: SegmentStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn status_label(job: &JobRecord) -> String {
    serde_json::to_value(job.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    ApiError::from(ServiceError::internal(e.to_string()))
}
