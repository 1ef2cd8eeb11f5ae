//! Error types for GeoForge services
//!
//! Provides:
//! - Distinct error types for each failure mode of the orchestration core
//! - HTTP status code mapping
//! - The uniform `{error_code, message, timestamp}` response envelope

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Request errors
    ValidationError,
    PayloadTooLarge,
    RateLimited,

    // Discovery control errors
    RunNotFound,
    InvalidTransition,

    // Upstream errors
    UpstreamUnavailable,
    GenerationFailed,

    // Sandbox errors
    ResourceExceeded,
    Timeout,

    // Internal errors
    InternalError,
    ConfigurationError,
    SerializationError,

    ServiceUnavailable,
}

impl ErrorCode {
    /// Wire representation used in the error envelope
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::PayloadTooLarge => "payload_too_large",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::RunNotFound => "run_not_found",
            ErrorCode::InvalidTransition => "invalid_transition",
            ErrorCode::UpstreamUnavailable => "upstream_unavailable",
            ErrorCode::GenerationFailed => "generation_failed",
            ErrorCode::ResourceExceeded => "resource_exceeded",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::ConfigurationError => "configuration_error",
            ErrorCode::SerializationError => "serialization_error",
            ErrorCode::ServiceUnavailable => "service_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Request errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Discovery control errors
    #[error("Discovery run not found: {id}")]
    RunNotFound { id: String },

    #[error("Cannot {action} discovery run {id} while it is {status}")]
    InvalidTransition {
        id: String,
        action: String,
        status: String,
    },

    // Upstream errors
    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("Generation failed after {attempts} attempt(s): {message}")]
    GenerationFailed { attempts: u32, message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Sandbox errors
    #[error("Resource limit exceeded: {message}")]
    ResourceExceeded { message: String },

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },
}

impl AppError {
    /// Shorthand for a validation error without a field
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Shorthand for an unreachable leaf service
    pub fn upstream(service: &str, message: impl Into<String>) -> Self {
        AppError::UpstreamUnavailable {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::RunNotFound { .. } => ErrorCode::RunNotFound,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::UpstreamUnavailable { .. } => ErrorCode::UpstreamUnavailable,
            AppError::GenerationFailed { .. } => ErrorCode::GenerationFailed,
            AppError::HttpClient(_) => ErrorCode::UpstreamUnavailable,
            AppError::ResourceExceeded { .. } => ErrorCode::ResourceExceeded,
            AppError::Timeout { .. } => ErrorCode::Timeout,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::RunNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::InvalidTransition { .. } => StatusCode::CONFLICT,

            // 413 Payload Too Large
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 422 Unprocessable Entity
            AppError::ResourceExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::GenerationFailed { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::UpstreamUnavailable { .. }
            | AppError::HttpClient(_)
            | AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Build the HTTP response, attaching structured details to the envelope
    pub fn into_response_with_details(self, details: Option<serde_json::Value>) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = %code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = %code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error_code: code,
            message,
            timestamp: Utc::now(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Uniform error envelope returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_response_with_details(None)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::RunNotFound { id: "abc".into() };
        assert_eq!(err.code(), ErrorCode::RunNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation_error() {
        let err = AppError::Validation {
            message: "message must not be empty".into(),
            field: Some("message".into()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.is_server_error());
        assert!(err.is_client_error());
    }

    #[test]
    fn test_invalid_transition_is_conflict() {
        let err = AppError::InvalidTransition {
            id: "run".into(),
            action: "resume".into(),
            status: "running".into(),
        };
        assert_eq!(err.code().as_str(), "invalid_transition");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "Cannot resume discovery run run while it is running");
    }

    #[test]
    fn test_generation_failed_is_server_error() {
        let err = AppError::GenerationFailed {
            attempts: 4,
            message: "timeout".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.is_server_error());
    }

    #[test]
    fn test_envelope_serializes_snake_case_code() {
        let body = ErrorResponse {
            error_code: ErrorCode::UpstreamUnavailable,
            message: "down".into(),
            timestamp: Utc::now(),
            details: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error_code"], "upstream_unavailable");
        assert!(json.get("details").is_none());
        assert!(json["timestamp"].is_string());
    }
}
