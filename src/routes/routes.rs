//! Defines the HTTP surface of the transformation service.
//!
//! ## Structure
//! - `GET    /health`                     — liveness
//! - `GET    /readyz`                     — readiness (store directory probe)
//! - `POST   /upload`                     — multipart upload, field `files`
//! - `DELETE /upload/{id}`                — delete an artifact
//! - `POST   /compression/{id}`           — compress an artifact
//! - `GET    /compression/download/{id}`  — download a result
//! - `POST   /conversion/{id}`            — convert an artifact
//! - `GET    /conversion/download/{id}`   — download a result
//! - `GET    /jobs/{job_id}`              — job record
//!
//! Every route is mounted at the root and again under `/api`; only the
//! `/api` copy is rate limited.

use crate::{
    errors::AppError,
    handlers::{
        health_handlers::{health, readyz},
        job_handlers::get_job,
        transform_handlers::{compress, convert, download},
        upload_handlers::{delete_upload, upload_files},
    },
    routes::rate_limit::{RateLimitState, log_requests, rate_limit_middleware},
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
};

/// The route table, without state or layers.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        .route("/upload", post(upload_files))
        .route("/upload/{id}", delete(delete_upload))
        .route("/compression/{id}", post(compress))
        .route("/compression/download/{id}", get(download))
        .route("/conversion/{id}", post(convert))
        .route("/conversion/download/{id}", get(download))
        .route("/jobs/{job_id}", get(get_job))
}

/// Build the complete application router.
///
/// `body_limit` caps a whole request body; per-file limits are enforced by
/// the artifact store while streaming.
pub fn app(state: AppState, rate_limit: RateLimitState, body_limit: usize) -> Router {
    let api = routes().layer(middleware::from_fn_with_state(
        rate_limit,
        rate_limit_middleware,
    ));

    Router::new()
        .merge(routes())
        .nest("/api", api)
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn route_not_found() -> AppError {
    AppError::not_found("Route not found")
}
