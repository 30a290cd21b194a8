use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("Unknown viewer: {0}")]
    UnknownViewer(String),

    #[error("No broadcaster is registered")]
    NoBroadcaster,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Cropper error: {0}")]
    Cropper(String),

    #[error("Registry is shut down")]
    RegistryClosed,

    #[error("Fatal invariant violation: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Stable machine-readable code carried on the wire `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadInput(_) => "BAD_INPUT",
            AppError::UnknownViewer(_) => "UNKNOWN_VIEWER",
            AppError::NoBroadcaster => "NO_BROADCASTER",
            AppError::Transport(_) => "TRANSPORT",
            AppError::Negotiation(_) => "NEGOTIATION",
            AppError::Cropper(_) => "CROPPER",
            AppError::RegistryClosed => "REGISTRY_CLOSED",
            AppError::InvariantViolation(_) => "INVARIANT",
            AppError::Io(_) => "IO",
            AppError::Serialization(_) => "SERIALIZATION",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadInput(_) => StatusCode::BAD_REQUEST,
            AppError::UnknownViewer(_) | AppError::NoBroadcaster => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body for HTTP endpoints
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            code: self.code(),
            message: self.to_string(),
        };

        tracing::error!(
            error_code = body.code,
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(AppError::BadInput("x".into()).code(), "BAD_INPUT");
        assert_eq!(AppError::UnknownViewer("x".into()).code(), "UNKNOWN_VIEWER");
        assert_eq!(AppError::NoBroadcaster.code(), "NO_BROADCASTER");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::BadInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::UnknownViewer("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
