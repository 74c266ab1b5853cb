#![cfg(unix)]

mod breaker_restarts;
mod directives;
mod guardrail_verdicts;
mod launch_and_crash;
mod stop_and_timeout;

use std::time::Duration;

use crate::core::config::SwarmConfig;
use crate::core::store::{EventQuery, EventRecord, RunRecord, Store};
use crate::core::swarm::SwarmManager;
use crate::core::swarm::guardrails::GuardrailRule;

/// A manager wired to an in-memory store whose workers are `sh -c <script>`.
/// The agent prompt lands in `$0`, so scripts can ignore it.
pub(super) struct Harness {
    pub manager: SwarmManager,
    pub project_id: i64,
    pub dir: tempfile::TempDir,
}

pub(super) fn test_config(script: &str) -> SwarmConfig {
    let mut config = SwarmConfig::default();
    config.worker.command = "sh".to_string();
    config.worker.args = vec!["-c".to_string(), script.to_string()];
    config.supervisor.tick_interval_ms = 50;
    config.supervisor.auto_restart = false;
    config.supervisor.stop_grace_secs = 2;
    config.supervisor.reader_join_timeout_secs = 1;
    config.checkpoints.debounce_secs = 0;
    config
}

pub(super) async fn harness(config: SwarmConfig, guardrails: Vec<GuardrailRule>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory();
    let project = store
        .create_project("demo", &dir.path().display().to_string())
        .await
        .unwrap();
    if !guardrails.is_empty() {
        store.set_guardrails(project.id, &guardrails).await.unwrap();
    }
    Harness {
        manager: SwarmManager::new(store, config),
        project_id: project.id,
        dir,
    }
}

impl Harness {
    /// Polls until the latest run leaves `running`.
    pub async fn wait_for_finish(&self) -> RunRecord {
        for _ in 0..200 {
            let runs = self.manager.get_run_history(self.project_id, 1).await.unwrap();
            if let Some(run) = runs.into_iter().next()
                && run.status != "running"
            {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("run did not finish in time");
    }

    pub async fn events(&self, event_type: &str) -> Vec<EventRecord> {
        let query = EventQuery {
            event_type: Some(event_type.to_string()),
            ..Default::default()
        };
        self.manager
            .list_events(self.project_id, &query)
            .await
            .unwrap()
            .events
    }

    /// Polls until at least one event of the given type exists.
    pub async fn wait_for_event(&self, event_type: &str) -> EventRecord {
        for _ in 0..200 {
            if let Some(event) = self.events(event_type).await.into_iter().next() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no {event_type} event in time");
    }
}
