use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::core::error::{SwarmError, SwarmResult};

pub const MAX_AGENTS: usize = 16;

static AGENT_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^W-(1[0-6]|[1-9])$").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Crashed,
    FailedGuardrail,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Crashed => "crashed",
            RunStatus::FailedGuardrail => "failed_guardrail",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "stopped" => Some(RunStatus::Stopped),
            "crashed" => Some(RunStatus::Crashed),
            "failed_guardrail" => Some(RunStatus::FailedGuardrail),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }

    /// Runs only ever leave `running`, once.
    pub fn can_transition(self, to: RunStatus) -> bool {
        self == RunStatus::Running && to.is_terminal()
    }
}

/// A validated worker name (`W-1` .. `W-16`). Construction is the only
/// place the pattern is checked, so anything holding an `AgentName` is safe
/// to use in process arguments and file paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AgentName(String);

impl AgentName {
    pub fn parse(raw: &str) -> SwarmResult<Self> {
        let valid = AGENT_NAME_RE
            .as_ref()
            .map(|re| re.is_match(raw))
            .unwrap_or(false);
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(SwarmError::validation(format!(
                "invalid agent name '{raw}': expected W-1 through W-{MAX_AGENTS}"
            )))
        }
    }

    /// `W-{index}` for a 1-based index.
    pub fn from_index(index: usize) -> SwarmResult<Self> {
        Self::parse(&format!("W-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn index(&self) -> usize {
        self.0
            .trim_start_matches("W-")
            .parse()
            .unwrap_or(0)
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry key. One live process at most per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub project_id: i64,
    pub name: AgentName,
}

impl AgentKey {
    pub fn new(project_id: i64, name: AgentName) -> Self {
        Self { project_id, name }
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> SwarmResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Priority::Normal),
            "urgent" => Ok(Priority::Urgent),
            other => Err(SwarmError::validation(format!(
                "invalid priority '{other}': expected normal or urgent"
            ))),
        }
    }
}

/// Per-agent view reported by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub exit_code: Option<i32>,
    pub started_at: String,
    pub restarts: u32,
    pub supports_stdin: bool,
    pub output_lines: usize,
    pub breaker: String,
    pub last_heartbeat_secs: Option<u64>,
    pub needs_attention: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchFailure {
    pub agent: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchResult {
    pub run_id: i64,
    pub pid: u32,
    pub launched: Vec<String>,
    pub failed: Vec<LaunchFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_names_accept_only_w1_to_w16() {
        for ok in ["W-1", "W-9", "W-10", "W-16"] {
            assert!(AgentName::parse(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["W-0", "W-17", "w-1", "W-01", "W-1/../x", "", "W-", "agent"] {
            assert!(AgentName::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn agent_name_index_roundtrip() {
        let name = AgentName::from_index(12).unwrap();
        assert_eq!(name.as_str(), "W-12");
        assert_eq!(name.index(), 12);
        assert!(AgentName::from_index(0).is_err());
    }

    #[test]
    fn run_status_only_leaves_running() {
        assert!(RunStatus::Running.can_transition(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition(RunStatus::FailedGuardrail));
        assert!(!RunStatus::Running.can_transition(RunStatus::Running));
        assert!(!RunStatus::Completed.can_transition(RunStatus::Stopped));
        assert_eq!(
            RunStatus::from_status("failed_guardrail"),
            Some(RunStatus::FailedGuardrail)
        );
        assert_eq!(RunStatus::from_status("paused"), None);
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!(Priority::parse("URGENT").unwrap(), Priority::Urgent);
        assert_eq!(Priority::parse("normal").unwrap(), Priority::Normal);
        assert!(Priority::parse("high").is_err());
    }
}
