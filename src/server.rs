//! HTTP boundary for one detection service.
//!
//! ```text
//! GET  {base}health/ping
//! POST {base}detector/fake_audio_detection    (audio)
//! POST {base}detector/lung_cancer_detection   (lung)
//! ```

mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::detector::DetectionService;

pub use error::{AppError, AppResult};

/// Shared application state, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub detector: Arc<dyn DetectionService>,
    /// Route prefix with leading and trailing `/`.
    pub base_api_path: String,
    /// Request body cap for uploads, in bytes.
    pub max_upload_bytes: usize,
}

/// Matches the `serve --max-upload-bytes` default.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

impl AppState {
    pub fn new(detector: Arc<dyn DetectionService>, base_api_path: impl Into<String>) -> Self {
        Self {
            detector,
            base_api_path: base_api_path.into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn detector_route(&self) -> String {
        format!(
            "{}detector/{}",
            self.base_api_path,
            self.detector.service().endpoint()
        )
    }
}

pub fn create_router(state: AppState) -> Router {
    let base = state.base_api_path.clone();
    let detector_route = state.detector_route();
    let body_limit = state.max_upload_bytes;
    tracing::info!(
        base = %base,
        detector = %detector_route,
        max_upload_bytes = body_limit,
        "routes registered"
    );

    Router::new()
        .route(&format!("{base}health/ping"), get(handlers::health::ping))
        .route(&detector_route, post(handlers::detector::detect))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
