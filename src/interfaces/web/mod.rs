mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::lifecycle::LifecycleComponent;
use crate::core::swarm::SwarmManager;

pub struct ApiServer {
    swarm: SwarmManager,
    log_tx: tokio::sync::broadcast::Sender<String>,
    api_host: String,
    api_port: u16,
    shutdown: CancellationToken,
}

pub struct ApiServerConfig {
    pub swarm: SwarmManager,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) swarm: SwarmManager,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_port: u16,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            swarm: config.swarm,
            log_tx: config.log_tx,
            api_host: config.api_host,
            api_port: config.api_port,
            shutdown: CancellationToken::new(),
        }
    }
}

// --- SSE streams (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(log) => Ok(Event::default().data(log)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Live lifecycle events of one project, one SSE message per event with
/// the event type as the SSE event name.
async fn sse_project_events_endpoint(
    Path(project_id): Path<i64>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.swarm.subscribe_events();
    let stream = BroadcastStream::new(receiver).filter_map(move |msg| match msg {
        Ok(event) if event.project_id == project_id => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().event(event.event_type.clone()).data(data)))
        }
        Ok(_) => None,
        Err(_) => Some(Ok(Event::default().event("lagged").data("Event stream lagged"))),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- Lifecycle Implementations ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.api_host, self.api_port);
        let state = AppState {
            swarm: self.swarm.clone(),
            log_tx: self.log_tx.clone(),
            api_port: self.api_port,
        };
        let app = router::build_api_router(state);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API server to {addr}"))?;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                tracing::error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.shutdown.cancel();
        Ok(())
    }
}
