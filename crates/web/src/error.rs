//! HTTP mapping for core errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relaygate_common::Error;
use tracing::error;

/// Wraps a core error for use as a handler error
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::TokenNotFound | Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::TokenExpired => StatusCode::GONE,
            Error::ProfileKindMismatch { .. } | Error::CredentialMissing(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::AlreadyExists { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match &self.0 {
            Error::TokenNotFound => "Invalid or expired connection link".to_string(),
            Error::TokenExpired => "Connection link has expired".to_string(),
            Error::NotFound { kind, .. } => format!("{} not found", kind),
            Error::ProfileKindMismatch { expected, .. } => {
                format!("This server cannot be opened as a {} session", expected)
            }
            Error::CredentialMissing(reason) => reason.clone(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "message": self.message(),
            })),
        )
            .into_response()
    }
}
