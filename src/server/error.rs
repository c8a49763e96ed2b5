//! Error envelope

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::errors::{ErrorCategory, XaiError};

pub type AppResult<T> = Result<T, AppError>;

/// A failed request, tagged with the handler it failed in.
#[derive(Debug)]
pub struct AppError {
    pub function: &'static str,
    pub error: XaiError,
}

impl AppError {
    pub fn new(function: &'static str, error: impl Into<XaiError>) -> Self {
        Self {
            function,
            error: error.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.error.category() {
            ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCategory::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCategory::Configuration | ErrorCategory::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if status.is_client_error() {
            tracing::warn!(function = self.function, error = %self.error, "rejected request");
            Json(json!({
                "error": self.error.to_string(),
            }))
        } else {
            let traceback = self.error.chain().join("\nCaused by: ");
            tracing::error!(function = self.function, "{traceback}");
            Json(json!({
                "error": self.error.to_string(),
                "traceback": traceback,
                "function": self.function,
            }))
        };

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        serde_json::from_slice(&bytes).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_unknown_method_is_bad_request() {
        let error = AppError::new(
            "detect",
            XaiError::UnknownMethod {
                method: "occlusion".to_string(),
            },
        );
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Unknown XAI method: occlusion");
        assert!(body.get("traceback").is_none());
    }

    #[tokio::test]
    async fn test_oversized_upload_keeps_413() {
        let error = AppError::new(
            "lung_cancer_detection",
            XaiError::PayloadTooLarge {
                reason: "length limit exceeded".to_string(),
            },
        );
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap_or_default().contains("length limit"));
        assert!(body.get("traceback").is_none());
    }

    #[tokio::test]
    async fn test_internal_error_carries_debug_envelope() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume");
        let error = AppError::new(
            "fake_audio_detection",
            XaiError::FileSystem {
                path: "/tmp/upload.wav".into(),
                operation: "upload spool".to_string(),
                source: io,
            },
        );
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["function"], "fake_audio_detection");
        let traceback = body["traceback"].as_str().unwrap_or_default();
        assert!(traceback.contains("upload spool"));
        assert!(traceback.contains("read-only volume"));
    }
}
