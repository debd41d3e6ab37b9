// src/error.rs

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Failures talking to the model or making sense of what it said.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Gemini API not properly initialized. Check your API key.")]
    Unavailable,

    #[error("model request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("model API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Empty response from model")]
    EmptyResponse,

    #[error("Could not parse the response as JSON")]
    Parse,

    #[error("could not read image: {0}")]
    Io(#[from] std::io::Error),
}

// Request URLs are stripped before the error can reach a response body or log.
impl From<reqwest::Error> for ExtractError {
    fn from(e: reqwest::Error) -> Self {
        ExtractError::Request(e.without_url())
    }
}

/// Persistence failures of the webhook config file.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write webhook config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode webhook config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("webhook url is required")]
    MissingUrl,
}

/// Everything a handler can answer with besides success.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("File too large. Maximum size is {}.", size_label(.limit))]
    PayloadTooLarge { limit: usize },

    #[error("{0}")]
    External(#[from] ExtractError),

    #[error("{0}")]
    Persistence(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::External(_) | ApiError::Persistence(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Whole mebibytes read as "16MB", anything else as plain bytes.
fn size_label(bytes: &usize) -> String {
    const MIB: usize = 1024 * 1024;
    if *bytes >= MIB && bytes % MIB == 0 {
        format!("{}MB", bytes / MIB)
    } else {
        format!("{bytes} bytes")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        error_envelope(status, &self.to_string())
    }
}

/// The uniform `{"error": "..."}` body every failure uses.
pub fn error_envelope(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
