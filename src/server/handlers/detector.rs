//! Detection handler: multipart upload in, prediction and base64 PNG overlay out.

use std::io::Cursor;
use std::path::Path;
use std::time::Instant;

use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::ImageFormat;
use ndarray::ArrayView3;
use serde::Serialize;

use crate::detector::{DetectorResult, ServiceKind};
use crate::errors::{Result, XaiError};
use crate::server::{AppError, AppResult, AppState};
use crate::xai::helpers::array_to_rgb_image;
use crate::xai::XaiMethod;

#[derive(Serialize)]
pub struct DetectionResponse {
    pub detector_result: DetectorResult,
    /// Seconds, rounded to four decimals.
    pub duration: f64,
    /// PNG overlay, no data-URI prefix.
    pub xai_image_base64: String,
}

struct Upload {
    filename: String,
    bytes: axum::body::Bytes,
}

pub async fn detect(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Json<DetectionResponse>> {
    let service = state.detector.service();
    let function = service.endpoint();
    let start = Instant::now();

    let (method, upload) = read_form(multipart)
        .await
        .map_err(|e| AppError::new(function, e))?;
    tracing::info!(
        service = %service,
        xai_method = %method,
        filename = %upload.filename,
        "detection request"
    );

    let temp_path = spool(&upload, service)
        .await
        .map_err(|e| AppError::new(function, e))?;
    let detector = state.detector.clone();
    let path = temp_path.to_path_buf();
    let joined = tokio::task::spawn_blocking(move || detector.detect(&path, method)).await;

    if let Err(e) = temp_path.close() {
        tracing::warn!(error = %e, "failed to remove uploaded file");
    }
    let detector_result = joined
        .map_err(|e| AppError::new(function, XaiError::model("detection task", e)))?
        .map_err(|e| AppError::new(function, e))?;

    let xai_image_base64 =
        xai_to_png_base64(detector_result.xai_explain.view()).map_err(|e| AppError::new(function, e))?;
    let duration = (start.elapsed().as_secs_f64() * 1e4).round() / 1e4;
    tracing::info!(service = %service, duration, "detection request completed");

    Ok(Json(DetectionResponse {
        detector_result,
        duration,
        xai_image_base64,
    }))
}

fn multipart_error(e: MultipartError) -> XaiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        XaiError::PayloadTooLarge {
            reason: e.body_text(),
        }
    } else {
        XaiError::invalid_input("multipart body", e.body_text())
    }
}

async fn read_form(mut multipart: Multipart) -> Result<(XaiMethod, Upload)> {
    let mut method = None;
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("xai_method") => {
                let text = field.text().await.map_err(multipart_error)?;
                method = Some(text.parse::<XaiMethod>()?);
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                upload = Some(Upload { filename, bytes });
            }
            _ => {}
        }
    }
    let method = method.ok_or_else(|| XaiError::invalid_input("xai_method", "is required"))?;
    let upload = upload.ok_or_else(|| XaiError::invalid_input("file", "is required"))?;
    if upload.bytes.is_empty() {
        return Err(XaiError::invalid_input("file", "is empty"));
    }
    Ok((method, upload))
}

/// Lower-cased extension of the uploaded name, or the service's usual one.
fn upload_suffix(filename: &str, service: ServiceKind) -> String {
    match Path::new(filename).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!(".{}", ext.to_ascii_lowercase()),
        _ => match service {
            ServiceKind::Audio => ".wav".to_string(),
            ServiceKind::Lung => ".png".to_string(),
        },
    }
}

async fn spool(upload: &Upload, service: ServiceKind) -> Result<tempfile::TempPath> {
    let temp_path = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(&upload_suffix(&upload.filename, service))
        .tempfile()?
        .into_temp_path();
    tokio::fs::write(&temp_path, &upload.bytes)
        .await
        .map_err(|e| XaiError::FileSystem {
            path: temp_path.to_path_buf(),
            operation: "upload spool".to_string(),
            source: e,
        })?;
    Ok(temp_path)
}

/// PNG-encode an `(H, W, 3)` overlay and base64 it.
pub fn xai_to_png_base64(pixels: ArrayView3<'_, u8>) -> Result<String> {
    let image = array_to_rgb_image(pixels)?;
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| XaiError::model("png encoding", e))?;
    Ok(BASE64.encode(buffer.into_inner()))
}
