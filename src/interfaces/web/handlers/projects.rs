use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;

use super::super::AppState;
use super::{ApiResponse, fail, ok};
use crate::core::swarm::guardrails::GuardrailRule;

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    name: String,
    folder: String,
    #[serde(default)]
    guardrails: Vec<GuardrailRule>,
}

pub async fn create_project_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<CreateProjectRequest>,
) -> ApiResponse {
    match state
        .swarm
        .create_project(&payload.name, &payload.folder, &payload.guardrails)
        .await
    {
        Ok(project) => ok(serde_json::json!({ "success": true, "project": project })),
        Err(e) => fail(e),
    }
}

pub async fn list_projects_endpoint(State(state): State<AppState>) -> ApiResponse {
    match state.swarm.list_projects().await {
        Ok(projects) => ok(serde_json::json!({ "success": true, "projects": projects })),
        Err(e) => fail(e),
    }
}

pub async fn get_project_endpoint(
    Path(project_id): Path<i64>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.get_project(project_id).await {
        Ok(project) => ok(serde_json::json!({ "success": true, "project": project })),
        Err(e) => fail(e),
    }
}

#[derive(Deserialize)]
pub struct GuardrailsRequest {
    guardrails: Vec<GuardrailRule>,
}

pub async fn set_guardrails_endpoint(
    Path(project_id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<GuardrailsRequest>,
) -> ApiResponse {
    match state
        .swarm
        .set_guardrails(project_id, &payload.guardrails)
        .await
    {
        Ok(()) => ok(serde_json::json!({
            "success": true,
            "guardrails": payload.guardrails,
        })),
        Err(e) => fail(e),
    }
}
