use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use tracing::info;

use super::super::AppState;
use super::{ApiResponse, fail, ok};

fn default_agent_count() -> usize {
    4
}

fn default_max_phases() -> usize {
    1
}

#[derive(Deserialize)]
pub struct LaunchRequest {
    #[serde(default = "default_agent_count")]
    agent_count: usize,
    #[serde(default = "default_max_phases")]
    max_phases: usize,
}

pub async fn launch_endpoint(
    Path(project_id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<LaunchRequest>,
) -> ApiResponse {
    info!(
        project_id,
        agents = payload.agent_count,
        "Launch requested via API"
    );
    match state
        .swarm
        .launch(project_id, payload.agent_count, payload.max_phases)
        .await
    {
        Ok(result) => ok(serde_json::json!({
            "success": true,
            "run_id": result.run_id,
            "pid": result.pid,
            "launched": result.launched,
            "failed": result.failed,
        })),
        Err(e) => fail(e),
    }
}

pub async fn stop_endpoint(
    Path(project_id): Path<i64>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.stop(project_id).await {
        Ok(stopped) => ok(serde_json::json!({ "success": true, "stopped": stopped })),
        Err(e) => fail(e),
    }
}

pub async fn stop_agent_endpoint(
    Path((project_id, agent)): Path<(i64, String)>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.stop_agent(project_id, &agent).await {
        Ok(stopped) => ok(serde_json::json!({ "success": true, "stopped": stopped })),
        Err(e) => fail(e),
    }
}

pub async fn status_endpoint(
    Path(project_id): Path<i64>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.get_status(project_id).await {
        Ok(status) => ok(serde_json::json!({ "success": true, "swarm": status })),
        Err(e) => fail(e),
    }
}

#[derive(Deserialize)]
pub struct OutputParams {
    agent: Option<String>,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

pub async fn output_endpoint(
    Path(project_id): Path<i64>,
    Query(params): Query<OutputParams>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state
        .swarm
        .get_output(project_id, params.agent.as_deref(), params.offset, params.limit)
        .await
    {
        Ok(page) => ok(serde_json::json!({
            "success": true,
            "lines": page.lines,
            "total": page.total,
            "next_offset": page.next_offset,
            "has_more": page.has_more,
        })),
        Err(e) => fail(e),
    }
}

fn default_search_limit() -> usize {
    100
}

#[derive(Deserialize)]
pub struct SearchParams {
    q: String,
    agent: Option<String>,
    #[serde(default)]
    context: usize,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

pub async fn search_endpoint(
    Path(project_id): Path<i64>,
    Query(params): Query<SearchParams>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state
        .swarm
        .search_output(
            project_id,
            &params.q,
            params.agent.as_deref(),
            params.context,
            params.limit,
        )
        .await
    {
        Ok(result) => ok(serde_json::json!({ "success": true, "search": result })),
        Err(e) => fail(e),
    }
}

#[derive(Deserialize)]
pub struct InputRequest {
    text: String,
    agent: Option<String>,
}

pub async fn input_endpoint(
    Path(project_id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<InputRequest>,
) -> ApiResponse {
    match state
        .swarm
        .send_input(project_id, &payload.text, payload.agent.as_deref())
        .await
    {
        Ok(delivered) => ok(serde_json::json!({ "success": true, "delivered": delivered })),
        Err(e) => fail(e),
    }
}

fn default_priority() -> String {
    "normal".to_string()
}

#[derive(Deserialize)]
pub struct DirectiveRequest {
    text: String,
    #[serde(default = "default_priority")]
    priority: String,
}

pub async fn send_directive_endpoint(
    Path((project_id, agent)): Path<(i64, String)>,
    State(state): State<AppState>,
    Json(payload): Json<DirectiveRequest>,
) -> ApiResponse {
    match state
        .swarm
        .send_directive(project_id, &agent, &payload.text, &payload.priority)
        .await
    {
        Ok(receipt) => ok(serde_json::json!({ "success": true, "directive": receipt })),
        Err(e) => fail(e),
    }
}

pub async fn get_directive_endpoint(
    Path((project_id, agent)): Path<(i64, String)>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.get_directive(project_id, &agent).await {
        Ok(pending) => ok(serde_json::json!({ "success": true, "directive": pending })),
        Err(e) => fail(e),
    }
}
