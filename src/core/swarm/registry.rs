//! Ownership of agent OS processes.
//!
//! The registry is the only place that holds `Child` handles. Every entry
//! is keyed by `(project_id, agent)` and a key never has two live
//! processes. Lifecycle transitions observed here are reported through the
//! event log as `agent_started`, `agent_stopped` and `agent_crashed`.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventKind, EventLog};
use super::output::{OutputHub, ReaderTarget};
use super::types::{AgentKey, AgentName};
use crate::core::error::{SwarmError, SwarmResult};
use crate::core::store::now_timestamp;
use crate::platform::{NativePlatform, Platform};

/// Everything needed to start one agent process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub key: AgentKey,
    pub run_id: i64,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub pipe_stdin: bool,
    pub log_path: Option<PathBuf>,
    /// Restarts already performed for this agent in the current run.
    pub restarts: u32,
}

struct AgentProcess {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    run_id: i64,
    started_at: String,
    exit_code: Option<i32>,
    alive: bool,
    stopping: bool,
    supports_stdin: bool,
    restarts: u32,
    cancel: CancellationToken,
    readers: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: AgentName,
    pub pid: Option<u32>,
    pub run_id: i64,
    pub started_at: String,
    pub exit_code: Option<i32>,
    pub alive: bool,
    pub supports_stdin: bool,
    pub restarts: u32,
}

#[derive(Debug, Clone)]
pub struct AgentExit {
    pub key: AgentKey,
    pub run_id: i64,
    pub exit_code: i32,
    pub restarts: u32,
}

impl AgentExit {
    pub fn crashed(&self) -> bool {
        self.exit_code != 0
    }
}

/// Handles taken out of the map so that terminating and joining happen
/// without holding the registry lock.
struct Detached {
    key: AgentKey,
    child: Option<Child>,
    cancel: CancellationToken,
    readers: Vec<JoinHandle<()>>,
}

pub struct ProcessRegistry {
    agents: Mutex<HashMap<AgentKey, AgentProcess>>,
    output: Arc<OutputHub>,
    events: EventLog,
    stop_grace: Duration,
    reader_join_timeout: Duration,
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

impl ProcessRegistry {
    pub fn new(
        output: Arc<OutputHub>,
        events: EventLog,
        stop_grace: Duration,
        reader_join_timeout: Duration,
    ) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            output,
            events,
            stop_grace,
            reader_join_timeout,
        }
    }

    /// Starts the agent process and its stdout/stderr readers. Fails if the
    /// key already has a live or stopping process.
    pub async fn spawn(&self, spec: SpawnSpec) -> SwarmResult<u32> {
        // Held across the spawn call itself so no second process can claim the key.
        let mut agents = self.agents.lock().await;
        if let Some(existing) = agents.get(&spec.key)
            && (existing.alive || existing.stopping)
        {
            return Err(SwarmError::validation(format!(
                "agent {} is already running",
                spec.key.name
            )));
        }
        let key = spec.key.clone();
        let run_id = spec.run_id;
        let pid = self.start_locked(&mut agents, spec).await?;
        drop(agents);

        self.announce_start(&key, run_id, pid).await;
        Ok(pid)
    }

    /// Swaps the agent's current process for a fresh one. The old entry
    /// stays counted as live until the new process holds the key, so the
    /// project never looks idle in between. Only agents the registry
    /// already tracks can be replaced. Returns the new pid and the restart
    /// count.
    pub async fn replace(&self, mut spec: SpawnSpec) -> SwarmResult<(u32, u32)> {
        let (was_alive, detached) = {
            let mut agents = self.agents.lock().await;
            let Some(agent) = agents.get_mut(&spec.key) else {
                return Err(SwarmError::not_found(format!(
                    "agent {} in project {}",
                    spec.key.name, spec.key.project_id
                )));
            };
            if agent.stopping {
                return Err(SwarmError::validation(format!(
                    "agent {} is already being stopped",
                    spec.key.name
                )));
            }
            spec.restarts = agent.restarts + 1;
            agent.stopping = true;
            agent.stdin = None;
            (
                agent.alive,
                Detached {
                    key: spec.key.clone(),
                    child: agent.child.take(),
                    cancel: agent.cancel.clone(),
                    readers: std::mem::take(&mut agent.readers),
                },
            )
        };
        self.shut_down(vec![detached]).await;

        let key = spec.key.clone();
        let run_id = spec.run_id;
        let restarts = spec.restarts;
        let mut agents = self.agents.lock().await;
        // A project stop that ran meanwhile has the final word.
        if !agents.get(&key).is_some_and(|a| a.stopping) {
            return Err(SwarmError::validation(format!(
                "agent {} was stopped during restart",
                key.name
            )));
        }
        agents.remove(&key);
        let started = self.start_locked(&mut agents, spec).await;
        drop(agents);

        if was_alive {
            self.events
                .emit(
                    key.project_id,
                    Some(run_id),
                    key.name.as_str(),
                    EventKind::AgentStopped,
                    "terminated",
                )
                .await;
        }
        let pid = started?;
        self.announce_start(&key, run_id, pid).await;
        Ok((pid, restarts))
    }

    async fn start_locked(
        &self,
        agents: &mut HashMap<AgentKey, AgentProcess>,
        spec: SpawnSpec,
    ) -> SwarmResult<u32> {
        let SpawnSpec {
            key,
            run_id,
            program,
            args,
            cwd,
            env,
            pipe_stdin,
            log_path,
            restarts,
        } = spec;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&cwd)
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SwarmError::Spawn(format!("{} ({}): {}", key.name, program, e)))?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take();
        let cancel = CancellationToken::new();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(
                self.output
                    .spawn_reader(
                        ReaderTarget {
                            key: key.clone(),
                            run_id,
                            log_path: log_path.clone(),
                        },
                        stdout,
                        self.events.clone(),
                        cancel.clone(),
                    )
                    .await,
            );
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(
                self.output
                    .spawn_reader(
                        ReaderTarget {
                            key: key.clone(),
                            run_id,
                            log_path,
                        },
                        stderr,
                        self.events.clone(),
                        cancel.clone(),
                    )
                    .await,
            );
        }

        agents.insert(
            key,
            AgentProcess {
                supports_stdin: stdin.is_some(),
                child: Some(child),
                stdin,
                pid: Some(pid),
                run_id,
                started_at: now_timestamp(),
                exit_code: None,
                alive: true,
                stopping: false,
                restarts,
                cancel,
                readers,
            },
        );
        Ok(pid)
    }

    async fn announce_start(&self, key: &AgentKey, run_id: i64, pid: u32) {
        info!(project_id = key.project_id, agent = %key.name, pid, "Agent started");
        self.events
            .emit(
                key.project_id,
                Some(run_id),
                key.name.as_str(),
                EventKind::AgentStarted,
                format!("pid {pid}"),
            )
            .await;
    }

    /// Checks every live agent of the project for exit and records the
    /// matching lifecycle event. Exited entries stay in the registry with
    /// their exit code until the project is cleaned up.
    pub async fn poll_exits(&self, project_id: i64) -> Vec<AgentExit> {
        let mut exits = Vec::new();
        {
            let mut agents = self.agents.lock().await;
            for (key, agent) in agents.iter_mut() {
                if key.project_id != project_id || !agent.alive || agent.stopping {
                    continue;
                }
                let Some(child) = agent.child.as_mut() else {
                    continue;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let code = exit_code_of(status);
                        agent.alive = false;
                        agent.exit_code = Some(code);
                        agent.child = None;
                        agent.stdin = None;
                        exits.push(AgentExit {
                            key: key.clone(),
                            run_id: agent.run_id,
                            exit_code: code,
                            restarts: agent.restarts,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => warn!(agent = %key.name, project_id, "try_wait failed: {}", e),
                }
            }
        }

        for exit in &exits {
            let kind = if exit.crashed() {
                EventKind::AgentCrashed
            } else {
                EventKind::AgentStopped
            };
            info!(
                project_id,
                agent = %exit.key.name,
                exit_code = exit.exit_code,
                "Agent exited"
            );
            self.events
                .emit(
                    project_id,
                    Some(exit.run_id),
                    exit.key.name.as_str(),
                    kind,
                    format!("exit code {}", exit.exit_code),
                )
                .await;
        }
        exits
    }

    /// Terminates one agent and removes its entry. Returns the removed
    /// agent's final state, or `None` if the key was unknown.
    pub async fn stop(&self, key: &AgentKey) -> Option<AgentInfo> {
        let detached = {
            let mut agents = self.agents.lock().await;
            let agent = agents.get_mut(key)?;
            agent.stopping = true;
            agent.stdin = None;
            Detached {
                key: key.clone(),
                child: agent.child.take(),
                cancel: agent.cancel.clone(),
                readers: std::mem::take(&mut agent.readers),
            }
        };

        let codes = self.shut_down(vec![detached]).await;
        let removed = self.agents.lock().await.remove(key)?;
        let exit_code = codes.get(key).copied().flatten().or(removed.exit_code);

        if removed.alive {
            self.events
                .emit(
                    key.project_id,
                    Some(removed.run_id),
                    key.name.as_str(),
                    EventKind::AgentStopped,
                    "terminated",
                )
                .await;
        }

        Some(AgentInfo {
            name: key.name.clone(),
            pid: removed.pid,
            run_id: removed.run_id,
            started_at: removed.started_at,
            exit_code,
            alive: false,
            supports_stdin: removed.supports_stdin,
            restarts: removed.restarts,
        })
    }

    /// Terminates every live agent of the project but keeps the entries for
    /// summaries. Agents killed here keep `exit_code: None`; only agents that
    /// exited on their own report a code.
    pub async fn terminate_project(&self, project_id: i64) {
        let detached: Vec<Detached> = {
            let mut agents = self.agents.lock().await;
            agents
                .iter_mut()
                .filter(|(key, _)| key.project_id == project_id)
                .map(|(key, agent)| {
                    agent.stopping = true;
                    agent.stdin = None;
                    Detached {
                        key: key.clone(),
                        child: agent.child.take(),
                        cancel: agent.cancel.clone(),
                        readers: std::mem::take(&mut agent.readers),
                    }
                })
                .collect()
        };
        if detached.is_empty() {
            return;
        }

        let keys: Vec<AgentKey> = detached.iter().map(|d| d.key.clone()).collect();
        self.shut_down(detached).await;

        let mut stopped = Vec::new();
        {
            let mut agents = self.agents.lock().await;
            for key in keys {
                if let Some(agent) = agents.get_mut(&key) {
                    if agent.alive {
                        stopped.push((key.clone(), agent.run_id));
                    }
                    agent.alive = false;
                    agent.stopping = false;
                }
            }
        }
        for (key, run_id) in stopped {
            self.events
                .emit(
                    project_id,
                    Some(run_id),
                    key.name.as_str(),
                    EventKind::AgentStopped,
                    "terminated",
                )
                .await;
        }
    }

    /// Waits, bounded by the reader join timeout, for the output readers of
    /// agents that already exited. Their remaining pipe contents end up in
    /// the buffers before anyone summarizes the run.
    pub async fn drain_readers(&self, project_id: i64) {
        let readers: Vec<JoinHandle<()>> = {
            let mut agents = self.agents.lock().await;
            agents
                .iter_mut()
                .filter(|(key, a)| key.project_id == project_id && !a.alive)
                .flat_map(|(_, a)| std::mem::take(&mut a.readers))
                .collect()
        };
        let deadline = Instant::now() + self.reader_join_timeout;
        for handle in readers {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!(project_id, "Output reader still busy after exit, continuing");
            }
        }
    }

    /// Terminates all of a project's agents and forgets them.
    pub async fn cleanup_project(&self, project_id: i64) {
        self.terminate_project(project_id).await;
        self.agents
            .lock()
            .await
            .retain(|key, _| key.project_id != project_id);
    }

    /// Signals readers to stop, terminates processes with a grace period
    /// and forced kill, then joins readers with a bounded wait. Termination
    /// comes before the join so that no reader is left blocked on a pipe.
    async fn shut_down(&self, detached: Vec<Detached>) -> HashMap<AgentKey, Option<i32>> {
        let mut children = Vec::new();
        let mut readers = Vec::new();
        for d in detached {
            d.cancel.cancel();
            readers.extend(d.readers);
            if let Some(child) = d.child {
                children.push((d.key, child));
            }
        }

        for (key, child) in &children {
            if let Some(pid) = child.id()
                && let Err(e) = NativePlatform::terminate_process(pid)
            {
                debug!(agent = %key.name, pid, "terminate signal failed: {}", e);
            }
        }

        let deadline = Instant::now() + self.stop_grace;
        let mut codes = HashMap::new();
        for (key, mut child) in children {
            let code = match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => Some(exit_code_of(status)),
                Ok(Err(e)) => {
                    warn!(agent = %key.name, "wait failed: {}", e);
                    None
                }
                Err(_) => {
                    warn!(agent = %key.name, "Agent ignored terminate, killing");
                    let _ = child.start_kill();
                    child.wait().await.ok().map(exit_code_of)
                }
            };
            codes.insert(key, code);
        }

        let join_deadline = Instant::now() + self.reader_join_timeout;
        for handle in readers {
            if tokio::time::timeout_at(join_deadline, handle).await.is_err() {
                warn!(
                    live_readers = self.output.live_readers(),
                    "Output reader did not finish before the join timeout"
                );
            }
        }
        codes
    }

    pub async fn is_alive(&self, key: &AgentKey) -> bool {
        self.agents
            .lock()
            .await
            .get(key)
            .map(|a| a.alive)
            .unwrap_or(false)
    }

    pub async fn live_count(&self, project_id: i64) -> usize {
        self.agents
            .lock()
            .await
            .iter()
            .filter(|(key, a)| key.project_id == project_id && a.alive)
            .count()
    }

    pub async fn list_for_project(&self, project_id: i64) -> Vec<AgentInfo> {
        let agents = self.agents.lock().await;
        let mut out: Vec<AgentInfo> = agents
            .iter()
            .filter(|(key, _)| key.project_id == project_id)
            .map(|(key, a)| AgentInfo {
                name: key.name.clone(),
                pid: a.pid,
                run_id: a.run_id,
                started_at: a.started_at.clone(),
                exit_code: a.exit_code,
                alive: a.alive,
                supports_stdin: a.supports_stdin,
                restarts: a.restarts,
            })
            .collect();
        out.sort_by_key(|a| a.name.index());
        out
    }

    /// Writes `text` plus a newline to the stdin of the selected live agents
    /// (all of the project's when `agent` is `None`). Returns who received it.
    /// A write that does not complete within the stop grace period counts as
    /// undelivered and the agent's stdin is closed.
    pub async fn write_stdin(
        &self,
        project_id: i64,
        agent: Option<&AgentName>,
        text: &str,
    ) -> Vec<AgentName> {
        let taken: Vec<(AgentKey, ChildStdin)> = {
            let mut agents = self.agents.lock().await;
            agents
                .iter_mut()
                .filter(|(key, a)| {
                    key.project_id == project_id
                        && a.alive
                        && !a.stopping
                        && agent.is_none_or(|name| &key.name == name)
                })
                .filter_map(|(key, a)| a.stdin.take().map(|s| (key.clone(), s)))
                .collect()
        };

        let mut delivered = Vec::new();
        let mut returned = Vec::new();
        let payload = format!("{text}\n");
        for (key, mut stdin) in taken {
            let write = async {
                stdin.write_all(payload.as_bytes()).await?;
                stdin.flush().await
            };
            match tokio::time::timeout(self.stop_grace, write).await {
                Ok(Ok(())) => {
                    delivered.push(key.name.clone());
                    returned.push((key, stdin));
                }
                Ok(Err(e)) => debug!(agent = %key.name, "stdin closed: {}", e),
                // A stalled pipe is dropped so later writes cannot block on it.
                Err(_) => warn!(
                    agent = %key.name,
                    "Agent stopped reading stdin, input not delivered"
                ),
            }
        }

        let mut agents = self.agents.lock().await;
        for (key, stdin) in returned {
            if let Some(a) = agents.get_mut(&key)
                && a.alive
            {
                a.stdin = Some(stdin);
            }
        }
        delivered
    }
}
