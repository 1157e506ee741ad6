use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ingest::BackfillError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Rejected input, `code` is the stable error code returned to callers
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Sync(#[from] BackfillError),
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            code,
            message: message.into(),
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest { code, .. } => (StatusCode::BAD_REQUEST, *code),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::Sync(_) => (StatusCode::INTERNAL_SERVER_ERROR, "sync_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "request failed");
        }

        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
