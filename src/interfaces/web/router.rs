use axum::{
    Json, Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post, put},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{projects, runs, swarm};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

async fn health_endpoint() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "service": "swarmd",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn build_api_router(state: AppState) -> Router {
    let cors = build_localhost_cors(state.api_port);

    Router::new()
        .route("/api/health", get(health_endpoint))
        .route(
            "/api/projects",
            get(projects::list_projects_endpoint).post(projects::create_project_endpoint),
        )
        .route("/api/projects/{id}", get(projects::get_project_endpoint))
        .route(
            "/api/projects/{id}/guardrails",
            put(projects::set_guardrails_endpoint),
        )
        .route("/api/projects/{id}/swarm/launch", post(swarm::launch_endpoint))
        .route("/api/projects/{id}/swarm/stop", post(swarm::stop_endpoint))
        .route("/api/projects/{id}/swarm/status", get(swarm::status_endpoint))
        .route("/api/projects/{id}/swarm/output", get(swarm::output_endpoint))
        .route("/api/projects/{id}/swarm/search", get(swarm::search_endpoint))
        .route("/api/projects/{id}/swarm/input", post(swarm::input_endpoint))
        .route(
            "/api/projects/{id}/swarm/agents/{agent}/stop",
            post(swarm::stop_agent_endpoint),
        )
        .route(
            "/api/projects/{id}/swarm/directives/{agent}",
            get(swarm::get_directive_endpoint).post(swarm::send_directive_endpoint),
        )
        .route("/api/projects/{id}/events", get(runs::list_events_endpoint))
        .route(
            "/api/projects/{id}/events/stream",
            get(super::sse_project_events_endpoint),
        )
        .route("/api/projects/{id}/runs", get(runs::run_history_endpoint))
        .route("/api/runs/compare", get(runs::compare_runs_endpoint))
        .route("/api/runs/{id}", get(runs::get_run_endpoint))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SwarmConfig;
    use crate::core::store::Store;
    use crate::core::swarm::SwarmManager;
    use axum::http::StatusCode;
    use tower::util::ServiceExt;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SwarmConfig::default();
        config.worker.command = "sh".to_string();
        config.worker.args = vec!["-c".to_string(), "echo hello; echo DONE".to_string()];
        config.supervisor.tick_interval_ms = 50;
        let (log_tx, _) = tokio::sync::broadcast::channel(16);
        let state = AppState {
            swarm: SwarmManager::new(Store::in_memory(), config),
            log_tx,
            api_port: 17900,
        };
        (state, dir)
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    async fn create_project(state: &AppState, dir: &tempfile::TempDir) -> i64 {
        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            "/api/projects",
            Some(serde_json::json!({
                "name": "demo",
                "folder": dir.path().display().to_string(),
                "guardrails": [{ "type": "regex_match", "pattern": "DONE" }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{json}");
        json["project"]["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let (state, _dir) = test_state();
        let app = build_api_router(state);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
        assert!(resp.headers().get("content-security-policy").is_some());
    }

    #[tokio::test]
    async fn project_crud_round_trip() {
        let (state, dir) = test_state();
        let id = create_project(&state, &dir).await;

        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            &format!("/api/projects/{id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["project"]["name"], "demo");
        assert_eq!(json["project"]["guardrails"][0]["type"], "regex_match");
        assert_eq!(json["project"]["guardrails"][0]["action"], "halt");

        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::PUT,
            &format!("/api/projects/{id}/guardrails"),
            Some(serde_json::json!({
                "guardrails": [{ "type": "max_errors", "threshold": 0, "action": "warn" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["guardrails"][0]["type"], "max_errors");

        let (_, json) =
            json_request(build_api_router(state), Method::GET, "/api/projects", None).await;
        assert_eq!(json["projects"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (state, dir) = test_state();
        let id = create_project(&state, &dir).await;

        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            "/api/projects/999/swarm/status",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "not_found");

        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            &format!("/api/projects/{id}/swarm/directives/W-99"),
            Some(serde_json::json!({ "text": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);

        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            &format!("/api/projects/{id}/swarm/search?q=%28unclosed"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["kind"], "invalid_pattern");

        let (status, _) = json_request(
            build_api_router(state),
            Method::PUT,
            &format!("/api/projects/{id}/guardrails"),
            Some(serde_json::json!({
                "guardrails": [{ "type": "regex_reject", "pattern": "(" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_then_read_history_and_events() {
        let (state, dir) = test_state();
        let id = create_project(&state, &dir).await;

        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            &format!("/api/projects/{id}/swarm/launch"),
            Some(serde_json::json!({ "agent_count": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["launched"].as_array().unwrap().len(), 2);
        let run_id = json["run_id"].as_i64().unwrap();

        let mut finished = serde_json::Value::Null;
        for _ in 0..200 {
            let (_, json) = json_request(
                build_api_router(state.clone()),
                Method::GET,
                &format!("/api/runs/{run_id}"),
                None,
            )
            .await;
            if json["run"]["status"] != "running" {
                finished = json;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(finished["run"]["status"], "completed");
        assert_eq!(finished["run"]["guardrail_results"][0]["passed"], true);

        let (_, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            &format!("/api/projects/{id}/swarm/output?agent=W-1&limit=1"),
            None,
        )
        .await;
        assert_eq!(json["lines"], serde_json::json!(["hello"]));
        assert_eq!(json["has_more"], true);
        assert_eq!(json["next_offset"], 1);

        let (_, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            &format!("/api/projects/{id}/events?event_type=agent_started"),
            None,
        )
        .await;
        assert_eq!(json["total"], 2);

        let (_, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            &format!("/api/projects/{id}/runs"),
            None,
        )
        .await;
        assert_eq!(json["runs"][0]["id"], run_id);

        let (status, json) = json_request(
            build_api_router(state),
            Method::GET,
            &format!("/api/runs/compare?a={run_id}&b={run_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["comparison"]["delta"]["total_output_lines"], 0);
    }
}
