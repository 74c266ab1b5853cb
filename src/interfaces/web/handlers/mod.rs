pub mod projects;
pub mod runs;
pub mod swarm;

use axum::{Json, http::StatusCode};
use tracing::error;

use crate::core::error::SwarmError;

pub(super) type ApiResponse = (StatusCode, Json<serde_json::Value>);

pub(super) fn ok(body: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

/// Maps a swarm error onto the status code and body clients expect.
pub(super) fn fail(err: SwarmError) -> ApiResponse {
    let status = match err {
        SwarmError::Validation(_) | SwarmError::InvalidPattern(_) => StatusCode::BAD_REQUEST,
        SwarmError::NotFound(_) => StatusCode::NOT_FOUND,
        SwarmError::Spawn(_)
        | SwarmError::Io(_)
        | SwarmError::Store(_)
        | SwarmError::Internal(_) => {
            error!("API request failed: {:#}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": err.to_string(),
            "kind": err.kind(),
        })),
    )
}
