use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::swarm::breaker::BreakerConfig;

/// Daemon configuration read from `swarmd.toml` in the data directory.
/// Every section and field is optional; missing values fall back to defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SwarmConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub checkpoints: CheckpointConfig,

    #[serde(default)]
    pub directives: DirectiveConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

/// How the external worker CLI is invoked. The agent prompt is appended
/// as the final argument.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub pipe_stdin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 0 disables the run timeout.
    #[serde(default)]
    pub run_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_reader_join_timeout_secs")]
    pub reader_join_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_agent_buffer_lines")]
    pub agent_buffer_lines: usize,
    #[serde(default = "default_project_buffer_lines")]
    pub project_buffer_lines: usize,
    #[serde(default = "default_milestone_every")]
    pub milestone_every: usize,
    #[serde(default = "default_true")]
    pub write_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_max_failures")]
    pub max_failures: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_recovery_secs")]
    pub recovery_secs: u64,
    /// How long a half-open probe must stay alive before it counts as a success.
    #[serde(default = "default_probe_grace_secs")]
    pub probe_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectiveConfig {
    #[serde(default = "default_directive_max_len")]
    pub max_len: usize,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    17900
}
fn default_worker_command() -> String {
    "claude".to_string()
}
fn default_worker_args() -> Vec<String> {
    vec![
        "--dangerously-skip-permissions".to_string(),
        "--output-format".to_string(),
        "text".to_string(),
        "-p".to_string(),
    ]
}
fn default_true() -> bool {
    true
}
fn default_tick_interval_ms() -> u64 {
    2000
}
fn default_stop_grace_secs() -> u64 {
    5
}
fn default_reader_join_timeout_secs() -> u64 {
    3
}
fn default_agent_buffer_lines() -> usize {
    5000
}
fn default_project_buffer_lines() -> usize {
    20000
}
fn default_milestone_every() -> usize {
    500
}
fn default_max_failures() -> usize {
    3
}
fn default_window_secs() -> u64 {
    300
}
fn default_recovery_secs() -> u64 {
    120
}
fn default_probe_grace_secs() -> u64 {
    30
}
fn default_debounce_secs() -> u64 {
    30
}
fn default_directive_max_len() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            api_port: default_api_port(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            env: HashMap::new(),
            pipe_stdin: true,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            run_timeout_secs: 0,
            auto_restart: true,
            stop_grace_secs: default_stop_grace_secs(),
            reader_join_timeout_secs: default_reader_join_timeout_secs(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            agent_buffer_lines: default_agent_buffer_lines(),
            project_buffer_lines: default_project_buffer_lines(),
            milestone_every: default_milestone_every(),
            write_logs: true,
        }
    }
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            window_secs: default_window_secs(),
            recovery_secs: default_recovery_secs(),
            probe_grace_secs: default_probe_grace_secs(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
        }
    }
}

impl Default for DirectiveConfig {
    fn default() -> Self {
        Self {
            max_len: default_directive_max_len(),
        }
    }
}

impl SupervisorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_secs(self.reader_join_timeout_secs)
    }
}

impl BreakerSection {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            max_failures: self.max_failures.max(1),
            window: Duration::from_secs(self.window_secs),
            recovery: Duration::from_secs(self.recovery_secs),
        }
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_secs(self.probe_grace_secs)
    }
}

impl SwarmConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join("swarmd.toml");
        if !config_path.exists() {
            info!("No swarmd.toml found, using default configuration.");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config = Self::parse(&content)?;
        info!("Loaded configuration from {}", config_path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: SwarmConfig = toml::from_str(content)?;

        // Zero-capacity buffers would drop every line.
        config.output.agent_buffer_lines = config.output.agent_buffer_lines.max(1);
        config.output.project_buffer_lines = config.output.project_buffer_lines.max(1);
        config.output.milestone_every = config.output.milestone_every.max(1);

        Ok(config)
    }
}
