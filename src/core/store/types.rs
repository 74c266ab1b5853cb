use serde::{Deserialize, Serialize};

use crate::core::swarm::guardrails::{GuardrailResult, GuardrailRule};

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub folder: String,
    pub guardrails: Vec<GuardrailRule>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub project_id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: String,
    pub agent_count: i64,
    pub max_phases: i64,
    pub summary: Option<serde_json::Value>,
    pub guardrail_results: Vec<GuardrailResult>,
}

/// An immutable lifecycle event row.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub project_id: i64,
    pub run_id: Option<i64>,
    pub agent_name: String,
    pub event_type: String,
    pub detail: String,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub project_id: i64,
    pub run_id: Option<i64>,
    pub agent_name: String,
    pub event_type: String,
    pub detail: String,
}

/// Filters for listing events. Time bounds are inclusive RFC 3339 strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventQuery {
    pub agent: Option<String>,
    pub event_type: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl EventQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(100).clamp(1, 1000)
    }

    pub fn effective_offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<EventRecord>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewCheckpoint {
    pub project_id: i64,
    pub run_id: i64,
    pub agent_name: String,
    pub checkpoint_type: String,
    pub data: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointRecord {
    pub id: i64,
    pub project_id: i64,
    pub run_id: i64,
    pub agent_name: String,
    pub checkpoint_type: String,
    pub data: String,
    pub created_at: String,
}
