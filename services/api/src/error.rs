use crate::poetry_client::GenerationError;
use crate::upload::UploadError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use thiserror::Error;
use tracing::error;

/// Every error that leaves the HTTP surface
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request input or an unknown style/language
    #[error("{0}")]
    Validation(String),

    /// Uploaded file rejected before storage
    #[error("{0}")]
    InvalidFile(String),

    #[error("{0}")]
    FileTooLarge(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    StorageNotConfigured(String),

    #[error("{message}")]
    Storage {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to generate poetry: {0}")]
    Generation(#[from] GenerationError),

    #[error("Database operation failed")]
    Database(#[source] anyhow::Error),

    #[error("An internal server error occurred")]
    Internal(#[source] anyhow::Error),
}

/// JSON error envelope shared by all endpoints
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn not_found(what: &str) -> Self {
        Self::NotFound(format!("{what} not found"))
    }

    pub fn storage(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Storage {
            message: message.into(),
            source,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidFile(_) | Self::StorageNotConfigured(_) => StatusCode::BAD_REQUEST,
            Self::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Storage { .. } | Self::Generation(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidFile(_) => "INVALID_FILE",
            Self::FileTooLarge(_) => "FILE_TOO_LARGE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::StorageNotConfigured(_) => "STORAGE_NOT_CONFIGURED",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Generation(_) => "POETRY_GENERATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::Validation(_)
            | Self::InvalidFile(_)
            | Self::FileTooLarge(_)
            | Self::NotFound(_)
            | Self::MethodNotAllowed
            | Self::StorageNotConfigured(_) => {
                Some(json!({ "status_code": self.status().as_u16() }))
            }
            _ => None,
        }
    }

    pub fn to_response_body(&self) -> ErrorResponse {
        ErrorResponse {
            success: false,
            error: self.kind(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::TooLarge { .. } => Self::FileTooLarge(err.to_string()),
            UploadError::EmptyFile
            | UploadError::ExtensionNotAllowed { .. }
            | UploadError::MimeTypeNotAllowed { .. } => Self::InvalidFile(err.to_string()),
            UploadError::Storage(source) => {
                Self::storage(format!("Failed to save image: {source}"), source)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Storage { source, .. } => error!(error = %source, "Storage operation failed"),
            Self::Generation(e) => error!(error = %e, "Poetry generation failed"),
            Self::Database(source) => error!(error = ?source, "Database operation failed"),
            Self::Internal(source) => error!(error = ?source, "Unhandled error"),
            _ => {}
        }
        (status, Json(self.to_response_body())).into_response()
    }
}

/// Response for a handler that panicked
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    ApiError::Internal(anyhow::anyhow!("handler panicked: {detail}")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_envelope() {
        let err = ApiError::not_found("Image");
        let body = serde_json::to_value(err.to_response_body()).unwrap();

        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "NOT_FOUND");
        assert_eq!(body["message"], "Image not found");
        assert_eq!(body["details"]["status_code"], 404);
    }

    #[test]
    fn test_internal_error_hides_cause() {
        let err = ApiError::Internal(anyhow::anyhow!("connection string leaked"));
        let body = err.to_response_body();

        assert_eq!(body.message, "An internal server error occurred");
        assert!(body.details.is_none());
    }

    #[test]
    fn test_method_not_allowed_envelope() {
        let body = serde_json::to_value(ApiError::MethodNotAllowed.to_response_body()).unwrap();
        assert_eq!(body["error"], "METHOD_NOT_ALLOWED");
        assert_eq!(body["details"]["status_code"], 405);
    }

    #[test]
    fn test_panic_response_is_internal_error() {
        let response = panic_response(Box::new("index out of bounds"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_database_error_hides_cause() {
        let err = ApiError::Database(anyhow::anyhow!("no such table: images"));
        assert_eq!(err.to_string(), "Database operation failed");
        assert_eq!(err.kind(), "DATABASE_ERROR");
    }

    #[test]
    fn test_upload_error_mapping() {
        let too_large: ApiError = UploadError::TooLarge {
            max_bytes: 10 * 1024 * 1024,
        }
        .into();
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(too_large.to_string().contains("File too large"));

        let bad_ext: ApiError = UploadError::ExtensionNotAllowed {
            extension: ".txt".to_string(),
        }
        .into();
        assert_eq!(bad_ext.status(), StatusCode::BAD_REQUEST);
        assert!(bad_ext.to_string().contains("not allowed"));
    }
}
