use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A category is enabled but has no usable default rate or burst.
    #[error("Policy for category '{category}' is misconfigured: {reason}")]
    PolicyMisconfigured { category: String, reason: String },

    /// A waiting caller was cancelled before a token became available.
    #[error("Wait for admission was cancelled")]
    Cancelled,

    #[error("No statistics recorded for key '{0}'")]
    KeyNotFound(String),

    #[error("Unknown admission category '{0}'")]
    CategoryNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient permission")]
    Forbidden,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

impl From<validator::ValidationErrors> for AdmissionError {
    fn from(err: validator::ValidationErrors) -> Self {
        AdmissionError::Validation(err.to_string())
    }
}

impl From<serde_yaml::Error> for AdmissionError {
    fn from(err: serde_yaml::Error) -> Self {
        AdmissionError::Config(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &'static str, status: StatusCode) -> Self {
        Self {
            error: error.into(),
            code,
            status,
        }
    }

    pub fn from_admission_error(err: &AdmissionError) -> Self {
        let message = err.to_string();
        match err {
            AdmissionError::PolicyMisconfigured { .. } => {
                Self::new(message, "POLICY_MISCONFIGURED", StatusCode::INTERNAL_SERVER_ERROR)
            }
            // 499 is the de facto "client closed request" status.
            AdmissionError::Cancelled => Self::new(
                message,
                "REQUEST_CANCELLED",
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
            ),
            AdmissionError::KeyNotFound(_) => Self::new(message, "KEY_NOT_FOUND", StatusCode::NOT_FOUND),
            AdmissionError::CategoryNotFound(_) => {
                Self::new(message, "CATEGORY_NOT_FOUND", StatusCode::NOT_FOUND)
            }
            AdmissionError::Validation(_) => {
                Self::new(message, "VALIDATION_ERROR", StatusCode::UNPROCESSABLE_ENTITY)
            }
            AdmissionError::Forbidden => {
                Self::new(message, "INSUFFICIENT_PERMISSION", StatusCode::FORBIDDEN)
            }
            AdmissionError::Config(_) | AdmissionError::Io(_) => {
                Self::new(message, "INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_admission_error(&self);
        if body.status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (body.status, Json(body)).into_response()
    }
}
