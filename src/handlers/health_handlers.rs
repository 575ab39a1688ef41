//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks storage-directory I/O

use crate::handlers::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that performs a best-effort write/read/delete against
/// the storage directory. Returns JSON describing the check. HTTP 200 when
/// it passes, HTTP 503 when it fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let tmp_path = state
        .store
        .base_path
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&tmp_path, b"readyz").await {
        Ok(_) => match fs::read(&tmp_path).await {
            Ok(content) if content == b"readyz" => {
                let _ = fs::remove_file(&tmp_path).await;
                (true, None::<String>)
            }
            Ok(_) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some("read-back mismatch".into()))
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some(format!("read error: {e}")))
            }
        },
        Err(e) => (false, Some(format!("write error: {e}"))),
    };

    let mut checks = HashMap::new();
    checks.insert(
        "storage_dir",
        CheckResult {
            ok: disk_check.0,
            detail: disk_check.1,
        },
    );

    let all_ok = checks.values().all(|check| check.ok);
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(checks))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct CheckResult {
    ok: bool,
    detail: Option<String>,
}
