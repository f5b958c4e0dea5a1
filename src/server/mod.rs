//! HTTP API
//!
//! Axum server exposing job submission, reader playback (segments, playlist,
//! merged audio), dictionary management, metrics, and admin status.

pub mod files;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

pub use state::{create_router, serve, AppState};
pub use types::ApiError;
