use axum::extract::{Path, Query, State};
use serde::Deserialize;

use super::super::AppState;
use super::{ApiResponse, fail, ok};
use crate::core::store::EventQuery;

pub async fn list_events_endpoint(
    Path(project_id): Path<i64>,
    Query(query): Query<EventQuery>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.list_events(project_id, &query).await {
        Ok(page) => ok(serde_json::json!({
            "success": true,
            "events": page.events,
            "total": page.total,
        })),
        Err(e) => fail(e),
    }
}

fn default_history_limit() -> usize {
    20
}

#[derive(Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

pub async fn run_history_endpoint(
    Path(project_id): Path<i64>,
    Query(params): Query<HistoryParams>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.get_run_history(project_id, params.limit).await {
        Ok(runs) => ok(serde_json::json!({ "success": true, "runs": runs })),
        Err(e) => fail(e),
    }
}

pub async fn get_run_endpoint(
    Path(run_id): Path<i64>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.get_run(run_id).await {
        Ok(run) => ok(serde_json::json!({ "success": true, "run": run })),
        Err(e) => fail(e),
    }
}

#[derive(Deserialize)]
pub struct CompareParams {
    a: i64,
    b: i64,
}

pub async fn compare_runs_endpoint(
    Query(params): Query<CompareParams>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.swarm.compare_runs(params.a, params.b).await {
        Ok(cmp) => ok(serde_json::json!({ "success": true, "comparison": cmp })),
        Err(e) => fail(e),
    }
}
