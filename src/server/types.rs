//! API types
//!
//! Request/response bodies shared across routes, plus the error wrapper
//! mapping service errors onto HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::error::ServiceError;
use crate::jobs::{JobRecord, ProgressSummary};
use crate::text::ReadingProfile;

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// HTTP-mapped service error
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::Admission { kind, message } => Self::new(
                StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::BAD_REQUEST),
                format!("admission.{}", kind),
                message.clone(),
            ),
            ServiceError::MergeLockTimeout { .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "merge.lock_timeout",
                err.to_string(),
            ),
            ServiceError::Resolver { message } => {
                Self::new(StatusCode::BAD_REQUEST, "resolver", message.clone())
            }
            ServiceError::Config { message, .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid", message.clone())
            }
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                err.to_string(),
            ),
        }
    }
}

/// Job submission body
#[derive(Debug, Clone, Deserialize)]
pub struct TtsJobRequest {
    pub text: String,
    #[serde(default)]
    pub model_id: Option<String>,
    /// Alias: "default" or "quality"
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub reading_profile: Option<ReadingProfile>,
    #[serde(default = "default_true")]
    pub prefer_phonemes: bool,
}

fn default_true() -> bool {
    true
}

/// Job + derived progress, as returned in manifests
#[derive(Debug, Clone, Serialize)]
pub struct JobManifest {
    #[serde(flatten)]
    pub job: JobRecord,
    #[serde(flatten)]
    pub progress: ProgressSummary,
}

impl From<JobRecord> for JobManifest {
    fn from(job: JobRecord) -> Self {
        let progress = job.progress();
        Self { job, progress }
    }
}

/// Submission / lookup envelope
#[derive(Debug, Clone, Serialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub manifest: JobManifest,
}

/// One playlist entry in playback order
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistEntry {
    pub index: usize,
    pub segment_id: String,
    pub status: String,
    pub ready: bool,
    pub url_proxy: String,
    pub url_backend: String,
    pub url_best: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Playlist response
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistResponse {
    pub job_id: String,
    pub playlist: Vec<PlaylistEntry>,
}

/// Model listing entry
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Dictionary upload body: `{name, entries}`
#[derive(Debug, Clone, Deserialize)]
pub struct DictUploadRequest {
    pub name: String,
    pub entries: HashMap<String, String>,
}

/// Override body
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideRequest {
    #[serde(default = "default_overrides_pack")]
    pub pack: String,
    pub key: String,
    pub phonemes: String,
}

fn default_overrides_pack() -> String {
    "local_overrides".to_string()
}

/// Learn body
#[derive(Debug, Clone, Deserialize)]
pub struct LearnRequest {
    pub key: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub phonemes: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Promote body
#[derive(Debug, Clone, Deserialize)]
pub struct PromoteRequest {
    pub key: String,
    #[serde(default = "default_overrides_pack")]
    pub target_pack: String,
    #[serde(default)]
    pub overwrite: bool,
}

/// Lookup / learn / override responses
#[derive(Debug, Clone, Serialize)]
pub struct PronunciationResponse {
    pub key: String,
    pub phonemes: String,
    pub source_pack: String,
}

/// Progress body served with 202 responses
#[derive(Debug, Clone, Serialize)]
pub struct ProgressResponse {
    pub job_id: String,
    pub status: String,
    #[serde(flatten)]
    pub progress: ProgressSummary,
}
