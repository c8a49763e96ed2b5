//! Liveness probe

use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct PingResponse {
    ok: bool,
}

pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse { ok: true })
}
