// src/server/extract.rs

use crate::error::ApiError;
use crate::flatten::{flatten, to_csv};
use crate::llm_extract::{ExtractionResult, SUPPORTED_IMAGE_EXTENSIONS};
use crate::state::SharedState;
use axum::Json;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use http_body_util::LengthLimitError;
use serde_json::{Value, json};
use std::error::Error as _;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{info, info_span, warn, Instrument};

/// `POST /api/extract`: multipart image upload in field `file`.
pub async fn extract_invoice(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ExtractionResult>, ApiError> {
    let mut multipart = multipart.map_err(|_| ApiError::Validation("No file uploaded".into()))?;

    let limit = state.max_body_bytes;
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() == Some("file") {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(|e| multipart_error(e, limit))?;
            upload = Some((file_name, bytes));
            break;
        }
    }

    let (file_name, bytes) = upload.ok_or_else(|| ApiError::Validation("No file uploaded".into()))?;
    if file_name.is_empty() {
        return Err(ApiError::Validation("No file selected".into()));
    }
    let ext = allowed_extension(&file_name).ok_or_else(|| {
        ApiError::Validation("Invalid file type. Please upload an image file.".into())
    })?;

    let span = info_span!("extract", file = %file_name, bytes = bytes.len());
    async move {
        let staged = stage_upload(&state.upload_dir, &ext, &bytes)
            .map_err(|e| ApiError::Internal(format!("Processing failed: {e}")))?;

        let result = state.extractor.extract_from_file(staged.path()).await;
        discard(staged);

        let data = result?;
        if data.is_empty() {
            return Err(ApiError::Validation(
                "No data could be extracted from the invoice".into(),
            ));
        }

        state.record_extraction(&data);
        info!(sections = data.len(), "Invoice extracted");
        Ok(Json(data))
    }
    .instrument(span)
    .await
}

fn multipart_error(e: MultipartError, limit: usize) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE || hit_length_limit(&e) {
        ApiError::PayloadTooLarge { limit }
    } else {
        ApiError::Validation(format!("Invalid upload: {}", e.body_text()))
    }
}

/// A body cut off by a length limit surfaces as a stream read failure,
/// with the limit error somewhere down the source chain.
fn hit_length_limit(e: &MultipartError) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if err.is::<LengthLimitError>() {
            return true;
        }
        source = err.source();
    }
    false
}

/// Lowercased extension if it is one we accept.
fn allowed_extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Write the upload to a randomly named file; it is removed when dropped.
fn stage_upload(dir: &Path, ext: &str, bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix("temp_invoice_")
        .suffix(&format!(".{ext}"))
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

fn discard(staged: NamedTempFile) {
    let path = staged.path().to_path_buf();
    if let Err(e) = staged.close() {
        warn!(path = %path.display(), error = %e, "Could not remove staged upload");
    }
}

/// Accept only a non-empty JSON object body.
fn data_from_body(
    body: Result<Json<Value>, JsonRejection>,
    limit: usize,
) -> Result<ExtractionResult, ApiError> {
    let Json(value) = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge { limit }
        } else {
            ApiError::Validation("No data provided".into())
        }
    })?;
    match value {
        Value::Object(map) if !map.is_empty() => Ok(map),
        _ => Err(ApiError::Validation("No data provided".into())),
    }
}

fn attachment(content_type: &'static str, file_name: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    )
        .into_response()
}

/// `POST /api/download-csv`: flatten the posted result into one CSV row.
pub async fn download_csv(
    State(state): State<SharedState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let data = data_from_body(body, state.max_body_bytes)?;
    let row = flatten(&data);
    let csv = to_csv(&row).map_err(|e| ApiError::Internal(format!("CSV generation failed: {e}")))?;
    info!(columns = row.len(), "CSV generated");
    Ok(attachment("text/csv; charset=utf-8", "extracted_invoice_data.csv", csv))
}

/// `POST /api/download-json`: the posted result, pretty-printed.
pub async fn download_json(
    State(state): State<SharedState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let data = data_from_body(body, state.max_body_bytes)?;
    let pretty = serde_json::to_string_pretty(&data)
        .map_err(|e| ApiError::Internal(format!("JSON generation failed: {e}")))?;
    Ok(attachment("application/json", "extracted_invoice_data.json", pretty))
}

pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "message": "Invoice extractor API is running",
        "extraction_available": state.extractor.is_available(),
        "webhook_deliveries_in_flight": state.dispatcher.in_flight(),
    }))
}
