//! Upload intake and explicit deletion.
//!
//! Uploads are streamed field by field straight into the artifact store;
//! nothing is buffered in memory beyond a multipart chunk.

use crate::{
    errors::AppError,
    services::{artifact_store::StoreError, classifier::{extension_for_upload, is_upload_allowed}},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::io;
use tracing::{debug, info};

/// Multipart field carrying the files.
pub const FILES_FIELD: &str = "files";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: String,
    pub original_name: String,
    pub filename: String,
    pub size: u64,
    pub mimetype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub count: usize,
    pub data: Vec<UploadedFile>,
}

/// `POST /upload`
///
/// Accepts up to `max_files` files in the `files` field. If any file is
/// rejected, the files already stored by this request are removed again.
pub async fn upload_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut stored = Vec::new();
    if let Err(err) = receive_files(&state, &mut multipart, &mut stored).await {
        for file in &stored {
            state.store().discard(&file.id).await;
        }
        return Err(err);
    }
    if stored.is_empty() {
        return Err(AppError::validation("No files were uploaded"));
    }

    info!("accepted {} uploaded file(s)", stored.len());
    Ok(Json(UploadResponse {
        success: true,
        count: stored.len(),
        data: stored,
    }))
}

async fn receive_files(
    state: &AppState,
    multipart: &mut Multipart,
    stored: &mut Vec<UploadedFile>,
) -> Result<(), AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILES_FIELD) {
            debug!("skipping multipart field {:?}", field.name());
            continue;
        }
        if stored.len() >= state.max_files {
            return Err(AppError::validation(format!(
                "Too many files (limit is {})",
                state.max_files
            )));
        }

        let original_name = field.file_name().unwrap_or("upload").to_string();
        let mimetype = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let ext = match extension_for_upload(&original_name, &mimetype) {
            Some(ext) if is_upload_allowed(&mimetype) => ext,
            _ => {
                return Err(AppError::validation(format!(
                    "Unsupported file type: {}",
                    mimetype
                )));
            }
        };

        let body = field.map(|chunk| chunk.map_err(io::Error::other));
        let artifact = state
            .store()
            .put_stream(ext, body)
            .await
            .map_err(upload_store_error)?;
        debug!(
            "stored {} as {} ({} bytes)",
            original_name, artifact.id, artifact.size_bytes
        );

        stored.push(UploadedFile {
            filename: artifact.id.clone(),
            id: artifact.id,
            original_name,
            size: artifact.size_bytes,
            mimetype,
            etag: artifact.etag,
        });
    }
    Ok(())
}

/// `DELETE /upload/{id}`
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.store().delete(&id).await?;
    let forgotten = state.tracker().forget_artifacts(&[id.clone()]).await;
    info!("deleted {} ({} job(s) forgotten)", id, forgotten);
    Ok(Json(json!({
        "success": true,
        "message": "File deleted successfully"
    })))
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::validation(err.body_text())
}

/// A broken or over-limit request body surfaces from the store as an I/O
/// error wrapping the multipart error; that is the client's fault.
fn upload_store_error(err: StoreError) -> AppError {
    match err {
        StoreError::Io(io_err)
            if io_err
                .get_ref()
                .is_some_and(|inner| inner.is::<MultipartError>()) =>
        {
            AppError::validation(format!("File upload error: {}", io_err))
        }
        other => other.into(),
    }
}
