//! Health & readiness handlers.
//!
//! - GET /health  -> liveness (`{"status":"ok"}`)
//! - GET /readyz  -> readiness that exercises the artifact directory

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /health`
///
/// Never touches disk or engines.
pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Performs a write/read/delete round trip in the store root. 200 when it
/// works, 503 otherwise, with the failing step in the body.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let tmp_path = state
        .store()
        .root()
        .join(format!(".readyz-{}", Uuid::new_v4()));

    let disk_check = match fs::write(&tmp_path, b"readyz").await {
        Ok(()) => match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => match fs::remove_file(&tmp_path).await {
                Ok(()) => CheckStatus::ok(),
                Err(e) => CheckStatus {
                    ok: true,
                    error: Some(format!("could not remove tmp file: {}", e)),
                },
            },
            Ok(_) => {
                let _ = fs::remove_file(&tmp_path).await;
                CheckStatus::failed("file content mismatch".into())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                CheckStatus::failed(format!("could not read tmp file: {}", e))
            }
        },
        Err(e) => CheckStatus::failed(format!("could not write tmp file: {}", e)),
    };

    let overall_ok = disk_check.ok;
    let mut checks = HashMap::new();
    checks.insert("disk", disk_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
