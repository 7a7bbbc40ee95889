//! Error types shared across the data plane.
//!
//! Domain failures are modeled as `CoreError`; the HTTP layer converts them
//! into `AppError`, a lightweight wrapper that keeps the message local and
//! renders as a JSON body.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures produced by the allocator, session manager, and scheduler.
///
/// Only `Transfer` is retryable; every other kind surfaces immediately on
/// the owning entity's `error` field together with a terminal status.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("no storage provider available: {0}")]
    ProviderUnavailable(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Convenience constructor for unknown-entity lookups.
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the session/job machinery may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::InvalidState { .. } => StatusCode::CONFLICT,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Cancelled(_) => StatusCode::CONFLICT,
            CoreError::Transfer(_) | CoreError::RetriesExhausted { .. } | CoreError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
