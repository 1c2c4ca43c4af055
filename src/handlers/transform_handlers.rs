//! Compression, conversion and result download.

use crate::{
    errors::AppError,
    models::options::{ConversionRequest, ProcessingOptions},
    state::AppState,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionData {
    pub id: String,
    pub job_id: Uuid,
    pub original_size: u64,
    pub compressed_size: u64,
    /// `compressedSize / originalSize` with two decimals, as a string.
    pub compression_ratio: String,
    /// Negative when the result grew.
    pub saved_space: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionData {
    pub id: String,
    pub job_id: Uuid,
    pub original_size: u64,
    pub converted_size: u64,
    pub original_format: String,
    pub new_format: String,
}

/// `POST /compression/{id}`
pub async fn compress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let options: ProcessingOptions = parse_body(&body)?;
    let outcome = state.transforms.compress(&id, options).await?;

    let original = outcome.source.size_bytes;
    let compressed = outcome.result.size_bytes;
    let ratio = outcome
        .job
        .result
        .as_ref()
        .map(|r| r.ratio)
        .unwrap_or_default();
    let data = CompressionData {
        id: outcome.result.id,
        job_id: outcome.job.id,
        original_size: original,
        compressed_size: compressed,
        compression_ratio: format!("{:.2}", ratio),
        saved_space: original as i64 - compressed as i64,
    };
    Ok(Json(json!({ "success": true, "data": data })))
}

/// `POST /conversion/{id}`
///
/// Accepts `{"format": "png"}` or `{"options": {"format": "png"}}`.
pub async fn convert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let request: ConversionRequest = parse_body(&body)?;
    let outcome = state.transforms.convert(&id, request.into_options()).await?;

    let data = ConversionData {
        original_format: outcome.source.extension().to_string(),
        new_format: outcome.strategy.output_extension().to_string(),
        id: outcome.result.id,
        job_id: outcome.job.id,
        original_size: outcome.source.size_bytes,
        converted_size: outcome.result.size_bytes,
    };
    Ok(Json(json!({ "success": true, "data": data })))
}

/// `GET /compression/download/{id}` and `GET /conversion/download/{id}`
///
/// Streams the artifact as an attachment.
pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (artifact, file) = state.store().open_reader(&id).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(
        response.headers_mut(),
        &artifact.id,
        &artifact.media_type,
        artifact.size_bytes,
    );
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, id: &str, media_type: &str, size: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(media_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    // Ids are validated to `[a-z0-9-]+.[a-z0-9]+`, so no quoting issues.
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", id)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

/// Parse an optional JSON body; an empty body means default options.
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| AppError::validation(format!("Invalid request body: {}", err)))
}
