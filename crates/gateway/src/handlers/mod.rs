//! HTTP handlers and request extractors

pub mod chat;
pub mod code;
pub mod discovery;
pub mod health;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Request},
    http::{header::CONTENT_LENGTH, request::Parts, StatusCode},
    Json,
};
use geoforge_common::errors::AppError;
use serde::de::DeserializeOwned;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::AppState;

/// JSON body that has been size-checked, deserialized and validated.
///
/// Every rejection is an [`AppError`], so malformed bodies get the same
/// envelope as handler failures.
pub struct ValidatedJson<T>(pub T);

impl<T> FromRequest<AppState> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let limit = state.config.server.max_body_bytes;
        let declared = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if let Some(size) = declared.filter(|size| *size > limit) {
            return Err(AppError::PayloadTooLarge { size, limit });
        }

        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| json_rejection(rejection, limit))?;
        value.validate().map_err(validation_error)?;
        Ok(Self(value))
    }
}

fn json_rejection(rejection: JsonRejection, limit: usize) -> AppError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        // Chunked bodies carry no length; report the first byte past the limit
        return AppError::PayloadTooLarge {
            size: limit.saturating_add(1),
            limit,
        };
    }
    AppError::validation(rejection.body_text())
}

fn validation_error(errors: ValidationErrors) -> AppError {
    let field = errors.field_errors().keys().map(|name| name.to_string()).min();
    AppError::Validation {
        message: errors.to_string(),
        field,
    }
}

/// Rejects strings that are empty after trimming
pub(crate) fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut error = ValidationError::new("blank");
        error.message = Some("must not be blank".into());
        return Err(error);
    }
    Ok(())
}

/// Discovery id from the path; ids that do not parse cannot name a run
pub struct RunId(pub Uuid);

impl<S> FromRequestParts<S> for RunId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| AppError::validation(rejection.body_text()))?;
        Uuid::parse_str(&raw)
            .map(Self)
            .map_err(|_| AppError::RunNotFound { id: raw })
    }
}
