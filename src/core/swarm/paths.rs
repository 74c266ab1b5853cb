use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::types::AgentName;

/// Fixed layout of the per-project `.swarm/` area shared with workers.
///
/// Every per-agent accessor takes an [`AgentName`], so no unvalidated input
/// can reach a path join.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    pub total: usize,
    pub done: usize,
    pub percent: u8,
}

/// Per-agent files read in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentFiles {
    pub prompt_fingerprint: Option<u64>,
    pub last_heartbeat_secs: Option<u64>,
    pub needs_attention: bool,
}

/// Everything the daemon polls from the shared area, sampled together.
#[derive(Debug, Clone, Default)]
pub struct AreaSnapshot {
    pub agents: HashMap<AgentName, AgentFiles>,
    pub signals: Vec<String>,
    pub tasks: TaskProgress,
    pub phase: usize,
}

impl AreaSnapshot {
    pub fn agent(&self, agent: &AgentName) -> AgentFiles {
        self.agents.get(agent).cloned().unwrap_or_default()
    }
}

impl ProjectPaths {
    pub fn new(project_folder: impl AsRef<Path>) -> Self {
        Self {
            root: project_folder.as_ref().join(".swarm"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for sub in [
            "heartbeats",
            "signals",
            "directives",
            "attention",
            "prompts",
            "logs",
        ] {
            std::fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    pub fn heartbeat_file(&self, agent: &AgentName) -> PathBuf {
        self.root.join("heartbeats").join(agent.as_str())
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    pub fn directives_dir(&self) -> PathBuf {
        self.root.join("directives")
    }

    pub fn directive_file(&self, agent: &AgentName) -> PathBuf {
        self.directives_dir()
            .join(format!("{}.json", agent.as_str()))
    }

    pub fn attention_file(&self, agent: &AgentName) -> PathBuf {
        self.root.join("attention").join(agent.as_str())
    }

    pub fn prompt_file(&self, agent: &AgentName) -> PathBuf {
        self.root
            .join("prompts")
            .join(format!("{}.md", agent.as_str()))
    }

    pub fn log_file(&self, agent: &AgentName) -> PathBuf {
        self.root
            .join("logs")
            .join(format!("{}.log", agent.as_str()))
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.md")
    }

    pub fn phase_file(&self) -> PathBuf {
        self.root.join("phase")
    }

    /// Seconds since the agent last touched its heartbeat file.
    pub fn last_heartbeat_secs(&self, agent: &AgentName) -> Option<u64> {
        let modified = std::fs::metadata(self.heartbeat_file(agent))
            .and_then(|m| m.modified())
            .ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        )
    }

    pub fn needs_attention(&self, agent: &AgentName) -> bool {
        self.attention_file(agent).exists()
    }

    /// Names of the signal files currently present, sorted.
    pub fn signals(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.signals_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    pub fn task_progress(&self) -> TaskProgress {
        std::fs::read_to_string(self.tasks_file())
            .map(|content| parse_tasks(&content))
            .unwrap_or_default()
    }

    /// Current phase, defaulting to 1 and capped at `max_phases`.
    pub fn phase(&self, max_phases: usize) -> usize {
        let phase = std::fs::read_to_string(self.phase_file())
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(1)
            .max(1);
        phase.min(max_phases.max(1))
    }

    pub fn read_prompt(&self, agent: &AgentName) -> Option<String> {
        std::fs::read_to_string(self.prompt_file(agent))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn prompt_fingerprint(&self, agent: &AgentName) -> Option<u64> {
        let bytes = std::fs::read(self.prompt_file(agent)).ok()?;
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        Some(hasher.finish())
    }

    pub fn snapshot(&self, agents: &[AgentName], max_phases: usize) -> AreaSnapshot {
        let agents = agents
            .iter()
            .map(|a| {
                let files = AgentFiles {
                    prompt_fingerprint: self.prompt_fingerprint(a),
                    last_heartbeat_secs: self.last_heartbeat_secs(a),
                    needs_attention: self.needs_attention(a),
                };
                (a.clone(), files)
            })
            .collect();
        AreaSnapshot {
            agents,
            signals: self.signals(),
            tasks: self.task_progress(),
            phase: self.phase(max_phases),
        }
    }

    /// Takes a [`snapshot`](Self::snapshot) on the blocking pool.
    pub async fn sample(
        &self,
        agents: Vec<AgentName>,
        max_phases: usize,
    ) -> anyhow::Result<AreaSnapshot> {
        let paths = self.clone();
        let snapshot =
            tokio::task::spawn_blocking(move || paths.snapshot(&agents, max_phases)).await?;
        Ok(snapshot)
    }
}

/// Counts `- [ ]` / `- [x]` checklist items in a markdown document.
pub fn parse_tasks(content: &str) -> TaskProgress {
    let mut total = 0;
    let mut done = 0;
    for line in content.lines() {
        let line = line.trim_start();
        let rest = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "));
        let Some(rest) = rest else { continue };
        if rest.starts_with("[ ]") {
            total += 1;
        } else if rest.starts_with("[x]") || rest.starts_with("[X]") {
            total += 1;
            done += 1;
        }
    }
    let percent = if total == 0 {
        0
    } else {
        ((done * 100) / total) as u8
    };
    TaskProgress {
        total,
        done,
        percent,
    }
}
