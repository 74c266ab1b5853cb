//! Per-run control loop.
//!
//! `Init -> Monitoring -> {AllExited | Timeout | Cancelled} -> Finalizing -> Terminated`
//!
//! Every tick polls agents for exit, applies the restart policy, watches
//! the directive mailboxes and prompt files, records progress checkpoints
//! and flushes them. Finalization consumes the supervisor, so it happens
//! once per run.

use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SwarmContext;
use super::breaker::RestartDecision;
use super::events::{EventKind, SWARM_AGENT};
use super::guardrails;
use super::paths::{AreaSnapshot, ProjectPaths};
use super::registry::AgentExit;
use super::types::{AgentKey, AgentName, RunStatus};
use crate::core::store::ProjectRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Monitoring,
    AllExited,
    Timeout,
    Cancelled,
    Finalizing,
    Terminated,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorState::Init => "init",
            SupervisorState::Monitoring => "monitoring",
            SupervisorState::AllExited => "all_exited",
            SupervisorState::Timeout => "timeout",
            SupervisorState::Cancelled => "cancelled",
            SupervisorState::Finalizing => "finalizing",
            SupervisorState::Terminated => "terminated",
        }
    }

    pub fn can_transition(self, to: SupervisorState) -> bool {
        use SupervisorState::*;
        match self {
            Init => matches!(to, Monitoring | Cancelled),
            Monitoring => matches!(to, AllExited | Timeout | Cancelled),
            AllExited | Timeout | Cancelled => to == Finalizing,
            Finalizing => to == Terminated,
            Terminated => false,
        }
    }
}

pub(crate) struct Supervisor {
    ctx: Arc<SwarmContext>,
    project: ProjectRecord,
    paths: ProjectPaths,
    run_id: i64,
    agents: Vec<AgentName>,
    max_phases: usize,
    cancel: CancellationToken,
    started: Instant,
    state: SupervisorState,
    prompt_prints: HashMap<AgentName, Option<u64>>,
    /// Crashed agents waiting for their breaker to allow a probe, with
    /// the restarts they had so far.
    parked: HashMap<AgentName, u32>,
    crashes: u32,
    restarts: u32,
    last_phase: usize,
}

impl Supervisor {
    pub(crate) async fn new(
        ctx: Arc<SwarmContext>,
        project: ProjectRecord,
        run_id: i64,
        agents: Vec<AgentName>,
        max_phases: usize,
        cancel: CancellationToken,
    ) -> Self {
        let paths = ProjectPaths::new(&project.folder);
        let snapshot = match paths.sample(agents.clone(), max_phases).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(run_id, "Could not read the shared area at launch: {:#}", e);
                AreaSnapshot {
                    phase: 1,
                    ..Default::default()
                }
            }
        };
        let prompt_prints = agents
            .iter()
            .map(|a| (a.clone(), snapshot.agent(a).prompt_fingerprint))
            .collect();
        let last_phase = snapshot.phase;
        Self {
            ctx,
            project,
            paths,
            run_id,
            agents,
            max_phases,
            cancel,
            started: Instant::now(),
            state: SupervisorState::Init,
            prompt_prints,
            parked: HashMap::new(),
            crashes: 0,
            restarts: 0,
            last_phase,
        }
    }

    fn transition(&mut self, to: SupervisorState) {
        if self.state.can_transition(to) {
            debug!(
                run_id = self.run_id,
                "supervisor {} -> {}",
                self.state.as_str(),
                to.as_str()
            );
            self.state = to;
        } else {
            warn!(
                run_id = self.run_id,
                "Ignoring supervisor transition {} -> {}",
                self.state.as_str(),
                to.as_str()
            );
        }
    }

    pub(crate) async fn run(mut self) -> RunStatus {
        let config = &self.ctx.config.supervisor;
        let mut interval = tokio::time::interval(config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = config.run_timeout().map(|t| self.started + t);

        info!(
            project_id = self.project.id,
            run_id = self.run_id,
            agents = self.agents.len(),
            "Supervisor started"
        );
        self.transition(SupervisorState::Monitoring);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.transition(SupervisorState::Cancelled);
                    break;
                }
                _ = interval.tick() => {}
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.transition(SupervisorState::Timeout);
                break;
            }

            if let Err(e) = self.tick().await {
                error!(run_id = self.run_id, "Supervisor tick failed: {:#}", e);
            }

            if self.ctx.registry.live_count(self.project.id).await == 0 {
                self.transition(SupervisorState::AllExited);
                break;
            }
        }

        self.finalize().await
    }

    async fn tick(&mut self) -> Result<()> {
        let project_id = self.project.id;

        let mut errors = self.retry_parked().await;
        let exits = self.ctx.registry.poll_exits(project_id).await;
        for exit in exits {
            self.ctx
                .checkpoints
                .record(
                    project_id,
                    self.run_id,
                    exit.key.name.as_str(),
                    "exit",
                    json!({ "exit_code": exit.exit_code, "restarts": exit.restarts }),
                )
                .await;
            if exit.crashed() {
                self.crashes += 1;
                if let Err(e) = self.handle_crash(&exit).await {
                    errors.push(format!("restart of {} failed: {e}", exit.key.name));
                }
            }
        }

        let grace = self.ctx.config.breaker.probe_grace();
        for key in self.ctx.breakers.probes_older_than(project_id, grace).await {
            if self.ctx.registry.is_alive(&key).await {
                info!(project_id, agent = %key.name, "Probe restart survived, closing breaker");
                self.ctx.breakers.record_probe_success(&key).await;
            }
        }

        self.ctx.directives.poll_consumed(project_id).await;
        match self.paths.sample(self.agents.clone(), self.max_phases).await {
            Ok(snapshot) => {
                self.watch_prompts(&snapshot).await;
                self.record_progress(&snapshot).await;
            }
            Err(e) => errors.push(format!("shared area: {e:#}")),
        }
        self.ctx.checkpoints.flush().await;

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{}", errors.join(", "))
        }
    }

    async fn handle_crash(&mut self, exit: &AgentExit) -> Result<()> {
        self.ctx.breakers.record_failure(&exit.key).await;
        if !self.ctx.config.supervisor.auto_restart || self.cancel.is_cancelled() {
            return Ok(());
        }
        self.try_restart(&exit.key, exit.restarts).await
    }

    /// Agents parked behind an open breaker get another chance once its
    /// recovery period has passed.
    async fn retry_parked(&mut self) -> Vec<String> {
        let parked: Vec<(AgentName, u32)> = self.parked.drain().collect();
        let mut errors = Vec::new();
        for (name, restarts) in parked {
            let key = AgentKey::new(self.project.id, name);
            if self.ctx.registry.is_alive(&key).await {
                continue;
            }
            if let Err(e) = self.try_restart(&key, restarts).await {
                errors.push(format!("restart of {} failed: {e}", key.name));
            }
        }
        errors
    }

    async fn try_restart(&mut self, key: &AgentKey, restarts: u32) -> Result<()> {
        let decision = self.ctx.breakers.check_restart_allowed(key, None).await;
        if !decision.permits_restart() {
            if decision == RestartDecision::Tripped {
                warn!(
                    project_id = key.project_id,
                    agent = %key.name,
                    "Circuit opened, auto-restart suspended"
                );
                self.ctx
                    .events
                    .emit(
                        key.project_id,
                        Some(self.run_id),
                        key.name.as_str(),
                        EventKind::CircuitOpened,
                        format!("{} failures", self.ctx.config.breaker.max_failures),
                    )
                    .await;
            } else {
                debug!(agent = %key.name, "restart denied by breaker");
            }
            self.parked.insert(key.name.clone(), restarts);
            return Ok(());
        }

        let restarts = restarts + 1;
        let spec = self.ctx.spawn_spec(
            &self.project,
            &self.paths,
            self.run_id,
            &key.name,
            self.max_phases,
            restarts,
        );
        let pid = self.ctx.registry.spawn(spec).await?;
        self.restarts += 1;
        let reason = if decision == RestartDecision::Probe {
            "probe"
        } else {
            "crash"
        };
        info!(agent = %key.name, pid, reason, "Agent restarted");
        self.ctx
            .events
            .emit(
                key.project_id,
                Some(self.run_id),
                key.name.as_str(),
                EventKind::AgentRestarted,
                format!("reason={reason} restarts={restarts} pid={pid}"),
            )
            .await;
        Ok(())
    }

    async fn watch_prompts(&mut self, snapshot: &AreaSnapshot) {
        for agent in &self.agents {
            let current = snapshot.agent(agent).prompt_fingerprint;
            let previous = self.prompt_prints.insert(agent.clone(), current);
            if previous.is_some_and(|prev| prev != current) {
                self.ctx
                    .events
                    .emit(
                        self.project.id,
                        Some(self.run_id),
                        agent.as_str(),
                        EventKind::PromptChanged,
                        if current.is_some() { "updated" } else { "removed" },
                    )
                    .await;
            }
        }
    }

    async fn record_progress(&mut self, snapshot: &AreaSnapshot) {
        let project_id = self.project.id;
        let tasks = snapshot.tasks;
        let phase = snapshot.phase;
        let lines = self.ctx.output.project_line_count(project_id).await;

        if phase != self.last_phase {
            info!(project_id, from = self.last_phase, to = phase, "Phase changed");
            self.last_phase = phase;
            self.ctx
                .checkpoints
                .record(project_id, self.run_id, SWARM_AGENT, "phase", json!({ "phase": phase }))
                .await;
        }

        self.ctx
            .checkpoints
            .record(
                project_id,
                self.run_id,
                SWARM_AGENT,
                "progress",
                json!({ "tasks": tasks, "phase": phase, "output_lines": lines }),
            )
            .await;
    }

    async fn finalize(mut self) -> RunStatus {
        let reason = self.state;
        self.transition(SupervisorState::Finalizing);
        let ctx = self.ctx.clone();
        let project_id = self.project.id;

        match reason {
            SupervisorState::Cancelled | SupervisorState::Timeout => {
                ctx.registry.terminate_project(project_id).await;
            }
            _ => ctx.registry.drain_readers(project_id).await,
        }

        ctx.checkpoints.flush().await;

        let agents = ctx.registry.list_for_project(project_id).await;
        let total_lines = ctx.output.project_line_count(project_id).await;
        let area = match self.paths.sample(Vec::new(), self.max_phases).await {
            Ok(area) => area,
            Err(e) => {
                warn!(run_id = self.run_id, "Could not read the shared area: {:#}", e);
                AreaSnapshot {
                    phase: self.last_phase,
                    ..Default::default()
                }
            }
        };
        let tasks = area.tasks;
        let summary = json!({
            "reason": reason.as_str(),
            "duration_secs": self.started.elapsed().as_secs(),
            "agents": agents.iter().map(|a| json!({
                "name": a.name,
                "exit_code": a.exit_code,
                "restarts": a.restarts,
            })).collect::<Vec<_>>(),
            "total_output_lines": total_lines,
            "signals": area.signals,
            "tasks": tasks,
            "tasks_percent": tasks.percent,
            "phase": area.phase,
            "crashes": self.crashes,
            "restarts": self.restarts,
        });

        let rules = match ctx.store.get_project(project_id).await {
            Ok(Some(p)) => p.guardrails,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(project_id, "Could not reload guardrails, using launch-time rules: {}", e);
                self.project.guardrails.clone()
            }
        };
        let (_, lines) = ctx.output.snapshot(project_id, None).await;
        let results = guardrails::evaluate(&rules, &lines.join("\n"));
        for failed in results.iter().filter(|r| !r.passed) {
            ctx.events
                .emit(
                    project_id,
                    Some(self.run_id),
                    SWARM_AGENT,
                    EventKind::GuardrailFailed,
                    format!(
                        "{} ({}): {}",
                        failed.rule_type.as_str(),
                        failed.action.as_str(),
                        failed.detail
                    ),
                )
                .await;
        }

        let status = match reason {
            SupervisorState::Cancelled | SupervisorState::Timeout => RunStatus::Stopped,
            _ if guardrails::halted(&results) => RunStatus::FailedGuardrail,
            _ => RunStatus::Completed,
        };

        match ctx
            .store
            .finish_run(self.run_id, status, &summary, &results)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(run_id = self.run_id, "Run was already finalized"),
            Err(e) => error!(run_id = self.run_id, "Failed to persist run verdict: {}", e),
        }
        ctx.events
            .emit(
                project_id,
                Some(self.run_id),
                SWARM_AGENT,
                EventKind::RunFinished,
                status.as_str(),
            )
            .await;

        self.transition(SupervisorState::Terminated);
        info!(
            project_id,
            run_id = self.run_id,
            status = status.as_str(),
            "Run finished"
        );
        status
    }
}
