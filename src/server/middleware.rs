//! Request middleware: API-key auth and per-client rate limiting

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;

use super::state::AppState;
use super::types::ErrorBody;

/// Token bucket table keyed by client identity
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    /// Tokens added per second; also the burst capacity per minute
    per_minute: u32,
}

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            per_minute,
        }
    }

    /// Spend one token for `client`; false when the bucket is dry
    pub fn check(&self, client: &str) -> bool {
        if self.per_minute == 0 {
            return true;
        }
        let capacity = self.per_minute as f64;
        let refill_per_sec = capacity / 60.0;
        let mut bucket = self.buckets.entry(client.to_string()).or_insert(Bucket {
            tokens: capacity,
            refreshed: Instant::now(),
        });
        let elapsed = bucket.refreshed.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.refreshed = Instant::now();
        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }
}

/// Identify the caller for rate limiting: API key, forwarded address, or a
/// shared local bucket
pub fn client_key(headers: &HeaderMap) -> String {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return format!("key:{}", key);
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return format!("addr:{}", forwarded.trim());
    }
    "local".to_string()
}

/// Reject mutating requests without the configured API key
pub async fn require_api_key(
    state: axum::extract::State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.api_key.as_deref() else {
        return next.run(request).await;
    };
    if request.method() == Method::GET || request.method() == Method::HEAD {
        return next.run(request).await;
    }
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    if presented == Some(expected) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                code: "unauthorized".to_string(),
                message: "missing or invalid API key".to_string(),
            }),
        )
            .into_response()
    }
}
