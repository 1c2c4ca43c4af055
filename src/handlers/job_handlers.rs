//! Job lookup.

use crate::{errors::AppError, state::AppState};
use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};
use uuid::Uuid;

/// `GET /jobs/{jobId}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let id = Uuid::try_parse(&job_id).map_err(|_| AppError::not_found("Job not found"))?;
    let job = state.tracker().get(id).await?;
    Ok(Json(json!({ "success": true, "data": job })))
}
