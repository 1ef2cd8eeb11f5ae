//! Sandboxed code execution handler

use axum::{extract::State, Json};
use geoforge_common::errors::Result;
use geoforge_sandbox::SandboxResult;
use serde::Deserialize;
use validator::Validate;

use super::ValidatedJson;
use crate::AppState;

/// Code execution request
#[derive(Debug, Deserialize, Validate)]
pub struct ExecuteCodeRequest {
    /// Python source; static checks run in the sandbox before anything is spawned
    pub code: String,

    /// Wall-clock limit; the configured default when unset
    pub timeout_s: Option<u64>,

    /// Honored only when the host permits sandbox network access
    #[serde(default)]
    pub allow_network: bool,
}

/// Execute analysis code.
///
/// Limit breaches and rejected code are reported in the result body; only
/// request errors and capacity exhaustion map to error responses.
pub async fn execute_code(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ExecuteCodeRequest>,
) -> Result<Json<SandboxResult>> {
    let request = state
        .sandbox
        .policy()
        .request(request.code, request.timeout_s, request.allow_network)?;
    let result = state.sandbox.execute(request).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: ExecuteCodeRequest = serde_json::from_str(r#"{"code": "print(1)"}"#).unwrap();
        assert_eq!(request.timeout_s, None);
        assert!(!request.allow_network);
    }
}
