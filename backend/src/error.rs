//! Error types and error handling for the application
//!
//! This module defines custom error types that can be converted to HTTP responses.
//! All errors implement `IntoResponse` to provide consistent error formatting.
//! Provider and cache failures never appear here: the fallback orchestrator
//! and the response cache absorb them.

use crate::balancer::CapacityError;
use crate::chat::store::StoreError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level error types
///
/// Each variant implements automatic conversion to HTTP responses via `IntoResponse`.
#[derive(Error, Debug)]
pub enum AppError {
    /// Request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Session with the given ID was not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session is closed or expired and accepts no more messages
    #[error("Session is no longer open: {0}")]
    SessionClosed(String),

    /// The load balancer refused the session; retryable
    #[error("{0}")]
    Capacity(#[from] CapacityError),

    /// Session persistence failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Internal server error (catch-all for unexpected errors)
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionClosed(_) => StatusCode::GONE,
            AppError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_message = self.to_string();

        if let AppError::Capacity(capacity) = &self {
            let retry_after = capacity.retry_after.as_secs().max(1);
            let body = Json(json!({
                "error": error_message,
                "status": status.as_u16(),
                "retry_after_secs": retry_after,
            }));
            let mut response = (status, body).into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            return response;
        }

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
