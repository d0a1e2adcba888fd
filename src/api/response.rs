//! JSON envelopes and error → HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::GenieError;

/// `{success: true, data}` with the given status
pub fn success<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(json!({ "success": true, "data": data }))).into_response()
}

impl GenieError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GenieError::MissingFileData
            | GenieError::InvalidInput(_)
            | GenieError::UnsupportedFileType(_)
            | GenieError::NotAnInvoice => StatusCode::BAD_REQUEST,
            GenieError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GenieError::InvoiceNotFound(_) | GenieError::ExtractedDataNotFound(_) => StatusCode::NOT_FOUND,
            GenieError::InvalidTransition { .. } => StatusCode::CONFLICT,
            GenieError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> Value {
        match self {
            GenieError::QuotaExceeded { remaining, limit } => json!({
                "error": "Usage limit exceeded",
                "details": self.to_string(),
                "remaining": remaining,
                "limit": limit,
                "upgrade_required": true,
            }),
            GenieError::NotAnInvoice => json!({
                "error": self.to_string(),
                "details": "The uploaded file does not look like an invoice or receipt",
            }),
            GenieError::Unauthorized(reason) => json!({
                "error": "Unauthorized",
                "details": reason,
            }),
            other if other.status_code().is_server_error() => json!({
                "error": "Failed to process request",
                "details": other.to_string(),
            }),
            other => json!({ "error": other.to_string() }),
        }
    }
}

impl IntoResponse for GenieError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }
        (status, Json(self.body())).into_response()
    }
}
