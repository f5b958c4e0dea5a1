//! Server state and router assembly

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Settings;
use crate::dict::DictStore;
use crate::jobs::JobManager;

use super::middleware::{require_api_key, RateLimiter};
use super::routes;

/// State shared across handlers
pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: Arc<JobManager>,
    pub dict_store: Arc<DictStore>,
    pub rate_limiter: RateLimiter,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        manager: Arc<JobManager>,
        dict_store: Arc<DictStore>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(settings.rate_limit_per_min);
        Self {
            settings,
            manager,
            dict_store,
            rate_limiter,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Build the full router with middleware layers
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/v1/models", get(routes::models::list_models))
        // Dictionary management
        .route("/v1/dicts", get(routes::dicts::list_dicts))
        .route("/v1/dicts/upload", post(routes::dicts::upload))
        .route("/v1/dicts/compile", post(routes::dicts::compile))
        .route("/v1/dicts/lookup", get(routes::dicts::lookup))
        .route("/v1/dicts/phonemize", get(routes::dicts::phonemize))
        .route("/v1/dicts/learn", post(routes::dicts::learn))
        .route("/v1/dicts/override", post(routes::dicts::override_entry))
        .route("/v1/dicts/promote", post(routes::dicts::promote))
        // Jobs and playback
        .route("/v1/tts/jobs", post(routes::tts::submit_job))
        .route("/v1/tts/jobs/:job_id", get(routes::tts::get_job))
        .route("/v1/tts/jobs/:job_id/cancel", post(routes::tts::cancel_job))
        .route(
            "/v1/tts/jobs/:job_id/segments/:segment_id",
            get(routes::tts::get_segment),
        )
        .route(
            "/v1/tts/jobs/:job_id/playlist.json",
            get(routes::tts::get_playlist),
        )
        .route(
            "/v1/tts/jobs/:job_id/audio.ogg",
            get(routes::tts::get_merged_audio),
        )
        .route("/v1/reader/synthesize", post(routes::reader::synthesize))
        // Observability
        .route("/v1/metrics", get(routes::metrics::metrics))
        .route("/v1/admin/status", get(routes::admin::status))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Bind and serve until shutdown
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.settings.host, state.settings.port);
    let router = create_router(state);
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
