//! Swarm supervision: launching agent fleets, watching them, and judging
//! the outcome of each run.

pub mod breaker;
pub mod checkpoints;
pub mod directives;
pub mod events;
pub mod guardrails;
pub mod output;
pub mod paths;
pub mod registry;
pub mod search;
mod supervisor;
pub mod types;

#[cfg(test)]
mod tests;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::SwarmConfig;
use crate::core::error::{SwarmError, SwarmResult};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::{EventPage, EventQuery, EventRecord, ProjectRecord, RunRecord, Store};

use breaker::BreakerBoard;
use checkpoints::CheckpointBatcher;
use directives::{DirectiveChannel, PendingDirective};
use events::{EventKind, EventLog, SWARM_AGENT};
use guardrails::GuardrailRule;
use output::{OutputHub, OutputPage};
use paths::{ProjectPaths, TaskProgress};
use registry::{ProcessRegistry, SpawnSpec};
use search::SearchResult;
use supervisor::Supervisor;
use types::{
    AgentKey, AgentName, AgentStatus, LaunchFailure, LaunchResult, MAX_AGENTS, Priority,
    RunStatus,
};

pub const MAX_PHASES: usize = 20;
pub const DEFAULT_OUTPUT_LIMIT: usize = 200;
pub const MAX_OUTPUT_LIMIT: usize = 5000;

/// Shared state every part of the swarm works against. Each component owns
/// its own lock; none of them is held across another component's call.
pub struct SwarmContext {
    pub store: Store,
    pub config: SwarmConfig,
    pub events: EventLog,
    pub output: Arc<OutputHub>,
    pub registry: ProcessRegistry,
    pub breakers: BreakerBoard,
    pub checkpoints: CheckpointBatcher,
    pub directives: DirectiveChannel,
}

impl SwarmContext {
    pub fn new(store: Store, config: SwarmConfig) -> Self {
        let events = EventLog::new(store.clone());
        let output = Arc::new(OutputHub::new(&config.output));
        let registry = ProcessRegistry::new(
            output.clone(),
            events.clone(),
            config.supervisor.stop_grace(),
            config.supervisor.reader_join_timeout(),
        );
        let breakers = BreakerBoard::new(config.breaker.to_breaker_config());
        let checkpoints = CheckpointBatcher::new(
            store.clone(),
            Duration::from_secs(config.checkpoints.debounce_secs),
        );
        let directives = DirectiveChannel::new(events.clone(), config.directives.max_len);
        Self {
            store,
            config,
            events,
            output,
            registry,
            breakers,
            checkpoints,
            directives,
        }
    }

    /// Process invocation for one agent: configured worker command and
    /// flags, the agent's prompt as the final argument, and the swarm
    /// environment contract.
    pub(crate) fn spawn_spec(
        &self,
        project: &ProjectRecord,
        paths: &ProjectPaths,
        run_id: i64,
        agent: &AgentName,
        max_phases: usize,
        restarts: u32,
    ) -> SpawnSpec {
        let worker = &self.config.worker;
        let prompt = paths
            .read_prompt(agent)
            .unwrap_or_else(|| default_prompt(project, paths, agent));

        let mut args = worker.args.clone();
        args.push(prompt);

        let mut env: Vec<(String, String)> = worker
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend([
            ("SWARM_AGENT_NAME".to_string(), agent.to_string()),
            ("SWARM_PROJECT_ID".to_string(), project.id.to_string()),
            ("SWARM_RUN_ID".to_string(), run_id.to_string()),
            ("SWARM_MAX_PHASES".to_string(), max_phases.to_string()),
            (
                "SWARM_DIRECTIVE_FILE".to_string(),
                paths.directive_file(agent).display().to_string(),
            ),
            (
                "SWARM_HEARTBEAT_FILE".to_string(),
                paths.heartbeat_file(agent).display().to_string(),
            ),
        ]);

        SpawnSpec {
            key: AgentKey::new(project.id, agent.clone()),
            run_id,
            program: worker.command.clone(),
            args,
            cwd: project.folder.clone().into(),
            env,
            pipe_stdin: worker.pipe_stdin,
            log_path: Some(paths.log_file(agent)),
            restarts,
        }
    }
}

fn default_prompt(project: &ProjectRecord, paths: &ProjectPaths, agent: &AgentName) -> String {
    format!(
        "You are {agent}, one agent of a swarm working on project '{name}'. \
         Read .swarm/tasks.md, pick an unchecked task no one else is on, finish it, \
         and check it off. Before each task, look for operator directives in {directive} \
         and delete the file once you have read it. Touch {heartbeat} while you work.",
        name = project.name,
        directive = paths.directive_file(agent).display(),
        heartbeat = paths.heartbeat_file(agent).display(),
    )
}

struct ActiveRun {
    run_id: i64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwarmStatus {
    pub project_id: i64,
    pub status: String,
    pub run_id: Option<i64>,
    pub agents: Vec<AgentStatus>,
    pub signals: Vec<String>,
    pub tasks: TaskProgress,
    pub phase: usize,
    pub max_phases: usize,
    pub output_lines: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectiveReceipt {
    pub agent: String,
    pub priority: Priority,
    pub queued_at: String,
    pub restarted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDelta {
    pub duration_secs: Option<i64>,
    pub total_output_lines: i64,
    pub crashes: i64,
    pub guardrails_passed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunComparison {
    pub run_a: RunRecord,
    pub run_b: RunRecord,
    /// `run_b` minus `run_a`.
    pub delta: RunDelta,
}

/// Entry point for every swarm operation exposed to the API.
#[derive(Clone)]
pub struct SwarmManager {
    ctx: Arc<SwarmContext>,
    runs: Arc<Mutex<HashMap<i64, ActiveRun>>>,
}

impl SwarmManager {
    pub fn new(store: Store, config: SwarmConfig) -> Self {
        Self {
            ctx: Arc::new(SwarmContext::new(store, config)),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.ctx.store
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<EventRecord> {
        self.ctx.events.subscribe()
    }

    async fn project(&self, project_id: i64) -> SwarmResult<ProjectRecord> {
        self.ctx
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| SwarmError::not_found(format!("project {project_id}")))
    }

    pub async fn create_project(
        &self,
        name: &str,
        folder: &str,
        guardrails: &[GuardrailRule],
    ) -> SwarmResult<ProjectRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SwarmError::validation("project name is required"));
        }
        let folder = std::fs::canonicalize(folder.trim()).map_err(|e| {
            SwarmError::validation(format!("project folder {folder}: {e}"))
        })?;
        if !folder.is_dir() {
            return Err(SwarmError::validation(format!(
                "project folder {} is not a directory",
                folder.display()
            )));
        }
        for rule in guardrails {
            rule.validate()?;
        }

        let project = self
            .ctx
            .store
            .create_project(name, &folder.display().to_string())
            .await?;
        if !guardrails.is_empty() {
            self.ctx.store.set_guardrails(project.id, guardrails).await?;
        }
        info!(project_id = project.id, name, "Project registered");
        self.project(project.id).await
    }

    pub async fn get_project(&self, project_id: i64) -> SwarmResult<ProjectRecord> {
        self.project(project_id).await
    }

    pub async fn list_projects(&self) -> SwarmResult<Vec<ProjectRecord>> {
        Ok(self.ctx.store.list_projects().await?)
    }

    /// Replaces the project's rules. An active run picks them up when it
    /// finalizes.
    pub async fn set_guardrails(&self, project_id: i64, rules: &[GuardrailRule]) -> SwarmResult<()> {
        for rule in rules {
            rule.validate()?;
        }
        if !self.ctx.store.set_guardrails(project_id, rules).await? {
            return Err(SwarmError::not_found(format!("project {project_id}")));
        }
        Ok(())
    }

    async fn active_run_id(&self, project_id: i64) -> Option<i64> {
        self.runs.lock().await.get(&project_id).map(|r| r.run_id)
    }

    pub async fn launch(
        &self,
        project_id: i64,
        agent_count: usize,
        max_phases: usize,
    ) -> SwarmResult<LaunchResult> {
        if !(1..=MAX_AGENTS).contains(&agent_count) {
            return Err(SwarmError::validation(format!(
                "agent_count must be between 1 and {MAX_AGENTS}"
            )));
        }
        if !(1..=MAX_PHASES).contains(&max_phases) {
            return Err(SwarmError::validation(format!(
                "max_phases must be between 1 and {MAX_PHASES}"
            )));
        }
        let project = self.project(project_id).await?;
        let folder = std::path::Path::new(&project.folder);
        if !folder.is_dir() {
            return Err(SwarmError::validation(format!(
                "project folder {} does not exist",
                project.folder
            )));
        }

        // Held for the whole launch so two launches cannot race.
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&project_id) || self.ctx.registry.live_count(project_id).await > 0 {
            return Err(SwarmError::validation("swarm already running"));
        }

        self.reset_project(project_id).await;
        let paths = ProjectPaths::new(folder);
        paths.ensure_layout()?;

        let run = self
            .ctx
            .store
            .create_run(project_id, agent_count, max_phases)
            .await?;
        self.ctx
            .directives
            .adopt_existing(project_id, run.id, &paths)
            .await;
        self.ctx
            .events
            .emit(
                project_id,
                Some(run.id),
                SWARM_AGENT,
                EventKind::RunStarted,
                format!("{agent_count} agents, {max_phases} phases"),
            )
            .await;

        let mut agents = Vec::with_capacity(agent_count);
        let mut launched = Vec::new();
        let mut failed = Vec::new();
        let mut first_pid = None;
        for index in 1..=agent_count {
            let name = AgentName::from_index(index)?;
            let spec = self
                .ctx
                .spawn_spec(&project, &paths, run.id, &name, max_phases, 0);
            match self.ctx.registry.spawn(spec).await {
                Ok(pid) => {
                    first_pid.get_or_insert(pid);
                    launched.push(name.to_string());
                }
                Err(e) => {
                    warn!(project_id, agent = %name, "Launch failed: {}", e);
                    failed.push(LaunchFailure {
                        agent: name.to_string(),
                        error: e.to_string(),
                    });
                }
            }
            agents.push(name);
        }

        let Some(pid) = first_pid else {
            self.ctx.registry.cleanup_project(project_id).await;
            let reasons: Vec<String> = failed.iter().map(|f| f.error.clone()).collect();
            let summary = serde_json::json!({ "reason": "spawn_failed", "errors": reasons });
            if let Err(e) = self
                .ctx
                .store
                .finish_run(run.id, RunStatus::Crashed, &summary, &[])
                .await
            {
                error!(run_id = run.id, "Failed to mark run crashed: {}", e);
            }
            self.ctx
                .events
                .emit(
                    project_id,
                    Some(run.id),
                    SWARM_AGENT,
                    EventKind::RunFinished,
                    RunStatus::Crashed.as_str(),
                )
                .await;
            return Err(SwarmError::Spawn(reasons.join("; ")));
        };

        let cancel = CancellationToken::new();
        let supervisor = Supervisor::new(
            self.ctx.clone(),
            project,
            run.id,
            agents,
            max_phases,
            cancel.clone(),
        )
        .await;
        let handle = self.spawn_supervisor(project_id, run.id, supervisor);
        runs.insert(
            project_id,
            ActiveRun {
                run_id: run.id,
                cancel,
                handle,
            },
        );

        info!(project_id, run_id = run.id, launched = launched.len(), "Swarm launched");
        Ok(LaunchResult {
            run_id: run.id,
            pid,
            launched,
            failed,
        })
    }

    /// Runs the supervisor in its own task. A panic inside it marks the run
    /// crashed instead of leaving it `running` forever.
    fn spawn_supervisor(&self, project_id: i64, run_id: i64, supervisor: Supervisor) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let runs = self.runs.clone();
        tokio::spawn(async move {
            let inner = tokio::spawn(supervisor.run());
            if let Err(e) = inner.await {
                error!(project_id, run_id, "Supervisor aborted: {}", e);
                ctx.registry.terminate_project(project_id).await;
                let summary = serde_json::json!({ "reason": "supervisor_failed", "error": e.to_string() });
                match ctx
                    .store
                    .finish_run(run_id, RunStatus::Crashed, &summary, &[])
                    .await
                {
                    Ok(true) => {
                        ctx.events
                            .emit(
                                project_id,
                                Some(run_id),
                                SWARM_AGENT,
                                EventKind::RunFinished,
                                RunStatus::Crashed.as_str(),
                            )
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => error!(run_id, "Failed to mark run crashed: {}", e),
                }
            }

            let mut runs = runs.lock().await;
            if runs.get(&project_id).is_some_and(|r| r.run_id == run_id) {
                runs.remove(&project_id);
            }
        })
    }

    /// Drops per-project tracking: registry entries, buffers, breakers,
    /// checkpoint cooldowns and known directives.
    async fn reset_project(&self, project_id: i64) {
        self.ctx.registry.cleanup_project(project_id).await;
        self.ctx.output.clear_project(project_id).await;
        self.ctx.breakers.clear_project(project_id).await;
        self.ctx.checkpoints.clear_project(project_id).await;
        self.ctx.directives.clear_project(project_id).await;
    }

    /// Stops the active run, if any, and clears everything tracked for the
    /// project. Returns whether a run was stopped.
    pub async fn stop(&self, project_id: i64) -> SwarmResult<bool> {
        self.project(project_id).await?;
        let active = self.runs.lock().await.remove(&project_id);
        let stopped = match active {
            Some(run) => {
                info!(project_id, run_id = run.run_id, "Stopping swarm");
                run.cancel.cancel();
                let sup = &self.ctx.config.supervisor;
                let wait = sup.stop_grace() + sup.reader_join_timeout() + Duration::from_secs(10);
                if tokio::time::timeout(wait, run.handle).await.is_err() {
                    warn!(project_id, run_id = run.run_id, "Supervisor did not finish in time");
                }
                true
            }
            None => false,
        };
        self.reset_project(project_id).await;
        Ok(stopped)
    }

    /// Terminates one agent of the project without touching the others.
    /// The supervisor ends the run once no agent is left alive.
    pub async fn stop_agent(&self, project_id: i64, agent: &str) -> SwarmResult<bool> {
        let agent = AgentName::parse(agent)?;
        self.project(project_id).await?;
        let key = AgentKey::new(project_id, agent);
        Ok(self.ctx.registry.stop(&key).await.is_some())
    }

    pub async fn get_status(&self, project_id: i64) -> SwarmResult<SwarmStatus> {
        let project = self.project(project_id).await?;
        let paths = ProjectPaths::new(&project.folder);
        let active = self.active_run_id(project_id).await;
        let latest = self.ctx.store.list_runs(project_id, 1).await?.into_iter().next();

        let status = match (&active, &latest) {
            (Some(_), _) => RunStatus::Running.as_str().to_string(),
            (None, Some(run)) => run.status.clone(),
            (None, None) => "idle".to_string(),
        };
        let max_phases = latest
            .as_ref()
            .map(|r| r.max_phases.max(1) as usize)
            .unwrap_or(1);

        let infos = self.ctx.registry.list_for_project(project_id).await;
        let names = infos.iter().map(|i| i.name.clone()).collect();
        let area = paths.sample(names, max_phases).await?;

        let mut agents = Vec::new();
        for info in infos {
            let key = AgentKey::new(project_id, info.name.clone());
            let files = area.agent(&info.name);
            agents.push(AgentStatus {
                name: info.name.to_string(),
                pid: info.pid,
                alive: info.alive,
                exit_code: info.exit_code,
                started_at: info.started_at,
                restarts: info.restarts,
                supports_stdin: info.supports_stdin,
                output_lines: self.ctx.output.line_count(&key).await,
                breaker: self.ctx.breakers.state(&key).await.as_str().to_string(),
                last_heartbeat_secs: files.last_heartbeat_secs,
                needs_attention: files.needs_attention,
            });
        }

        Ok(SwarmStatus {
            project_id,
            status,
            run_id: active.or(latest.map(|r| r.id)),
            agents,
            signals: area.signals,
            tasks: area.tasks,
            phase: area.phase,
            max_phases,
            output_lines: self.ctx.output.project_line_count(project_id).await,
        })
    }

    pub async fn get_output(
        &self,
        project_id: i64,
        agent: Option<&str>,
        offset: usize,
        limit: Option<usize>,
    ) -> SwarmResult<OutputPage> {
        self.project(project_id).await?;
        let agent = agent.map(AgentName::parse).transpose()?;
        let limit = limit
            .unwrap_or(DEFAULT_OUTPUT_LIMIT)
            .clamp(1, MAX_OUTPUT_LIMIT);
        Ok(self
            .ctx
            .output
            .page(project_id, agent.as_ref(), offset, limit)
            .await)
    }

    /// Writes a line to the stdin of one agent or of every live agent.
    pub async fn send_input(
        &self,
        project_id: i64,
        text: &str,
        agent: Option<&str>,
    ) -> SwarmResult<Vec<String>> {
        self.project(project_id).await?;
        let agent = agent.map(AgentName::parse).transpose()?;
        let text = directives::sanitize(text, self.ctx.config.directives.max_len)?;
        let delivered = self
            .ctx
            .registry
            .write_stdin(project_id, agent.as_ref(), &text)
            .await;
        if delivered.is_empty() {
            return Err(SwarmError::validation("no running agent accepts input"));
        }
        Ok(delivered.into_iter().map(|a| a.to_string()).collect())
    }

    pub async fn send_directive(
        &self,
        project_id: i64,
        agent: &str,
        text: &str,
        priority: &str,
    ) -> SwarmResult<DirectiveReceipt> {
        let agent = AgentName::parse(agent)?;
        let priority = Priority::parse(priority)?;
        let project = self.project(project_id).await?;
        let paths = ProjectPaths::new(&project.folder);
        let run_id = self.active_run_id(project_id).await;

        let directive = self
            .ctx
            .directives
            .send(project_id, run_id, &paths, &agent, text, priority)
            .await?;

        let mut restarted = false;
        if priority == Priority::Urgent
            && let Some(run_id) = run_id
        {
            restarted = self
                .restart_for_directive(&project, &paths, run_id, &agent)
                .await?;
        }

        Ok(DirectiveReceipt {
            agent: directive.agent,
            priority: directive.priority,
            queued_at: directive.queued_at,
            restarted,
        })
    }

    /// Replaces the agent's process so the fresh instance reads the
    /// directive at startup. Agents the run never launched are left alone
    /// and the directive simply stays queued.
    async fn restart_for_directive(
        &self,
        project: &ProjectRecord,
        paths: &ProjectPaths,
        run_id: i64,
        agent: &AgentName,
    ) -> SwarmResult<bool> {
        let max_phases = self
            .ctx
            .store
            .get_run(run_id)
            .await?
            .map(|r| r.max_phases.max(1) as usize)
            .unwrap_or(1);

        let spec = self
            .ctx
            .spawn_spec(project, paths, run_id, agent, max_phases, 0);
        let (pid, restarts) = match self.ctx.registry.replace(spec).await {
            Ok(replaced) => replaced,
            Err(SwarmError::NotFound(_)) => {
                info!(project_id = project.id, agent = %agent, "Urgent directive left queued; agent is not part of the run");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        info!(project_id = project.id, agent = %agent, pid, "Agent restarted for urgent directive");
        self.ctx
            .events
            .emit(
                project.id,
                Some(run_id),
                agent.as_str(),
                EventKind::AgentRestarted,
                format!("reason=directive restarts={restarts} pid={pid}"),
            )
            .await;
        Ok(true)
    }

    pub async fn get_directive(&self, project_id: i64, agent: &str) -> SwarmResult<PendingDirective> {
        let agent = AgentName::parse(agent)?;
        let project = self.project(project_id).await?;
        let paths = ProjectPaths::new(&project.folder);
        Ok(self.ctx.directives.get_pending(&paths, &agent).await)
    }

    pub async fn search_output(
        &self,
        project_id: i64,
        query: &str,
        agent: Option<&str>,
        context: usize,
        limit: usize,
    ) -> SwarmResult<SearchResult> {
        self.project(project_id).await?;
        let agent = agent.map(AgentName::parse).transpose()?;
        let (first_offset, lines) = self.ctx.output.snapshot(project_id, agent.as_ref()).await;
        search::search_lines(
            &lines,
            first_offset,
            query,
            agent.as_ref().map(|a| a.as_str()),
            context,
            limit,
        )
    }

    pub async fn list_events(&self, project_id: i64, query: &EventQuery) -> SwarmResult<EventPage> {
        self.project(project_id).await?;
        Ok(self.ctx.events.query(project_id, query).await?)
    }

    pub async fn get_run_history(&self, project_id: i64, limit: usize) -> SwarmResult<Vec<RunRecord>> {
        self.project(project_id).await?;
        Ok(self.ctx.store.list_runs(project_id, limit.clamp(1, 500)).await?)
    }

    pub async fn get_run(&self, run_id: i64) -> SwarmResult<RunRecord> {
        self.ctx
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| SwarmError::not_found(format!("run {run_id}")))
    }

    pub async fn compare_runs(&self, run_a: i64, run_b: i64) -> SwarmResult<RunComparison> {
        let a = self.get_run(run_a).await?;
        let b = self.get_run(run_b).await?;
        let delta = RunDelta {
            duration_secs: match (run_duration_secs(&a), run_duration_secs(&b)) {
                (Some(da), Some(db)) => Some(db - da),
                _ => None,
            },
            total_output_lines: summary_i64(&b, "total_output_lines")
                - summary_i64(&a, "total_output_lines"),
            crashes: summary_i64(&b, "crashes") - summary_i64(&a, "crashes"),
            guardrails_passed: passed_count(&b) - passed_count(&a),
        };
        Ok(RunComparison {
            run_a: a,
            run_b: b,
            delta,
        })
    }

    /// Stops every active run. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        let projects: Vec<i64> = self.runs.lock().await.keys().copied().collect();
        for project_id in projects {
            if let Err(e) = self.stop(project_id).await {
                warn!(project_id, "Failed to stop swarm on shutdown: {}", e);
            }
        }
    }
}

fn run_duration_secs(run: &RunRecord) -> Option<i64> {
    let start = chrono::DateTime::parse_from_rfc3339(&run.started_at).ok()?;
    let end = chrono::DateTime::parse_from_rfc3339(run.ended_at.as_deref()?).ok()?;
    Some((end - start).num_seconds())
}

fn summary_i64(run: &RunRecord, field: &str) -> i64 {
    run.summary
        .as_ref()
        .and_then(|s| s.get(field))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

fn passed_count(run: &RunRecord) -> i64 {
    run.guardrail_results.iter().filter(|r| r.passed).count() as i64
}

#[async_trait]
impl LifecycleComponent for SwarmManager {
    async fn on_init(&mut self) -> Result<()> {
        info!("Swarm manager initializing...");
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Swarm manager shutting down, stopping active runs...");
        self.shutdown().await;
        Ok(())
    }
}
