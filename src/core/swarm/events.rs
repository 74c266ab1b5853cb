use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::store::{EventPage, EventQuery, EventRecord, NewEvent, Store};

/// Agent label used for run-level events that belong to no single worker.
pub const SWARM_AGENT: &str = "swarm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    AgentStarted,
    AgentStopped,
    AgentCrashed,
    AgentRestarted,
    OutputMilestone,
    DirectiveQueued,
    DirectiveConsumed,
    PromptChanged,
    RunStarted,
    RunFinished,
    CircuitOpened,
    GuardrailFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AgentStarted => "agent_started",
            EventKind::AgentStopped => "agent_stopped",
            EventKind::AgentCrashed => "agent_crashed",
            EventKind::AgentRestarted => "agent_restarted",
            EventKind::OutputMilestone => "output_milestone",
            EventKind::DirectiveQueued => "directive_queued",
            EventKind::DirectiveConsumed => "directive_consumed",
            EventKind::PromptChanged => "prompt_changed",
            EventKind::RunStarted => "run_started",
            EventKind::RunFinished => "run_finished",
            EventKind::CircuitOpened => "circuit_opened",
            EventKind::GuardrailFailed => "guardrail_failed",
        }
    }
}

/// Single entry point for lifecycle events. Every event is persisted first
/// and then pushed to live subscribers; ordering therefore follows the
/// store's insertion order.
#[derive(Clone)]
pub struct EventLog {
    store: Store,
    tx: broadcast::Sender<EventRecord>,
}

impl EventLog {
    pub fn new(store: Store) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { store, tx }
    }

    /// Appends an event. Persistence failures are logged and the event is
    /// dropped; callers never fail because the log could not be written.
    pub async fn emit(
        &self,
        project_id: i64,
        run_id: Option<i64>,
        agent: &str,
        kind: EventKind,
        detail: impl Into<String>,
    ) -> Option<EventRecord> {
        let event = NewEvent {
            project_id,
            run_id,
            agent_name: agent.to_string(),
            event_type: kind.as_str().to_string(),
            detail: detail.into(),
        };
        match self.store.append_event(&event).await {
            Ok(record) => {
                debug!(
                    project_id,
                    agent = %record.agent_name,
                    event = %record.event_type,
                    "event recorded"
                );
                let _ = self.tx.send(record.clone());
                Some(record)
            }
            Err(e) => {
                warn!(
                    project_id,
                    agent = %event.agent_name,
                    event = %event.event_type,
                    "Failed to append event: {}",
                    e
                );
                None
            }
        }
    }

    pub async fn query(&self, project_id: i64, query: &EventQuery) -> anyhow::Result<EventPage> {
        self.store.query_events(project_id, query).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}
