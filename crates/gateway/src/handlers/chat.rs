//! Chat handler

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use geoforge_common::{
    errors::AppError,
    models::{GenerationParams, Query},
};
use geoforge_context::ChatFailure;
use serde::Deserialize;
use validator::Validate;

use super::{not_blank, ValidatedJson};
use crate::AppState;

/// Chat request
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(custom(function = "not_blank"))]
    pub message: String,

    /// Document ids whose full text is added to the context
    #[serde(default)]
    #[validate(length(max = 32))]
    pub selected_file_ids: Vec<String>,

    #[serde(default)]
    pub enable_web_search: bool,

    #[serde(default)]
    pub include_thinking: bool,

    #[validate(range(min = 1, max = 32768))]
    pub max_tokens: Option<u32>,

    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
}

impl From<ChatRequest> for Query {
    fn from(request: ChatRequest) -> Self {
        Query {
            message: request.message,
            selected_file_ids: request.selected_file_ids,
            enable_web_search: request.enable_web_search,
            include_thinking: request.include_thinking,
            params: GenerationParams {
                max_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }
}

/// Run one chat turn.
///
/// A failed turn still returns the context it collected under
/// `details.sources`. The whole turn is bounded by the server request timeout.
pub async fn chat(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ChatRequest>,
) -> Response {
    let deadline = state.config.request_timeout();
    match tokio::time::timeout(deadline, state.chat.handle(Query::from(request))).await {
        Err(_) => AppError::Timeout {
            timeout_ms: deadline.as_millis() as u64,
        }
        .into_response(),
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(ChatFailure { error, sources })) => {
            let details = if sources.is_empty() {
                None
            } else {
                serde_json::to_value(&sources)
                    .ok()
                    .map(|sources| serde_json::json!({ "sources": sources }))
            };
            error.into_response_with_details(details)
        }
    }
}
