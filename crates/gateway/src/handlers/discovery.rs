//! Discovery run handlers

use axum::{extract::State, http::StatusCode, Json};
use geoforge_common::errors::Result;
use geoforge_context::discovery::{DiscoverySnapshot, RunOptions, RunStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{not_blank, RunId, ValidatedJson};
use crate::AppState;

/// Start discovery request
#[derive(Debug, Deserialize, Validate)]
pub struct StartDiscoveryRequest {
    #[validate(custom(function = "not_blank"))]
    pub query: String,

    #[serde(default = "default_true")]
    pub include_web_search: bool,

    #[serde(default = "default_true")]
    pub include_knowledge_base: bool,

    /// Leading plan steps to run
    #[validate(range(min = 1))]
    pub max_steps: Option<usize>,
}

fn default_true() -> bool {
    true
}

/// Status after a start or control call
#[derive(Debug, Serialize)]
pub struct DiscoveryStatusResponse {
    pub discovery_id: Uuid,
    pub status: RunStatus,
}

/// Create a run; steps execute in the background
pub async fn start_discovery(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<StartDiscoveryRequest>,
) -> Result<(StatusCode, Json<DiscoveryStatusResponse>)> {
    let options = RunOptions {
        include_web_search: request.include_web_search,
        include_knowledge_base: request.include_knowledge_base,
        max_steps: request.max_steps,
    };
    let snapshot = state.discovery.start(request.query, options).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DiscoveryStatusResponse {
            discovery_id: snapshot.discovery_id,
            status: snapshot.run.status,
        }),
    ))
}

/// Current snapshot of a run
pub async fn get_discovery(
    State(state): State<AppState>,
    RunId(id): RunId,
) -> Result<Json<DiscoverySnapshot>> {
    Ok(Json(state.discovery.snapshot(id).await?))
}

/// Delete a run, stopping it first when it is still active
pub async fn delete_discovery(State(state): State<AppState>, RunId(id): RunId) -> Result<StatusCode> {
    state.discovery.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_discovery(
    State(state): State<AppState>,
    RunId(id): RunId,
) -> Result<Json<DiscoveryStatusResponse>> {
    let status = state.discovery.pause(id).await?;
    Ok(Json(DiscoveryStatusResponse { discovery_id: id, status }))
}

pub async fn resume_discovery(
    State(state): State<AppState>,
    RunId(id): RunId,
) -> Result<Json<DiscoveryStatusResponse>> {
    let status = state.discovery.resume(id).await?;
    Ok(Json(DiscoveryStatusResponse { discovery_id: id, status }))
}

pub async fn stop_discovery(
    State(state): State<AppState>,
    RunId(id): RunId,
) -> Result<Json<DiscoveryStatusResponse>> {
    let status = state.discovery.stop(id).await?;
    Ok(Json(DiscoveryStatusResponse { discovery_id: id, status }))
}
