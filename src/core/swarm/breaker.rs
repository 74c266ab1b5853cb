//! Restart gating for crashed agents.
//!
//! Failures are tracked in a sliding window per agent:
//! - Closed: restarts allowed
//! - Open: restarts denied until the recovery period has passed
//! - HalfOpen: one probe restart is in flight; its outcome closes or reopens

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::types::AgentKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures inside `window` that trip the breaker.
    pub max_failures: usize,
    pub window: Duration,
    /// Time spent open before a probe restart is allowed.
    pub recovery: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            window: Duration::from_secs(300),
            recovery: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Allowed,
    /// Allowed as the single half-open probe.
    Probe,
    /// Denied, and this call moved the breaker from closed to open.
    Tripped,
    Denied,
}

impl RestartDecision {
    pub fn permits_restart(self) -> bool {
        matches!(self, RestartDecision::Allowed | RestartDecision::Probe)
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failures: VecDeque<Instant>,
    state: BreakerState,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            failures: VecDeque::new(),
            state: BreakerState::Closed,
            opened_at: None,
            probe_started_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn probe_started_at(&self) -> Option<Instant> {
        self.probe_started_at
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    /// A failure while probing reopens at once with a fresh recovery period.
    pub fn record_failure_at(&mut self, now: Instant) {
        self.failures.push_back(now);
        if self.state == BreakerState::HalfOpen {
            self.open_at(now);
        }
    }

    pub fn check_restart_allowed(&mut self, config: &BreakerConfig) -> RestartDecision {
        self.check_restart_allowed_at(Instant::now(), config)
    }

    pub fn check_restart_allowed_at(
        &mut self,
        now: Instant,
        config: &BreakerConfig,
    ) -> RestartDecision {
        self.prune(now, config.window);
        match self.state {
            BreakerState::Closed => {
                if self.failures.len() >= config.max_failures.max(1) {
                    self.open_at(now);
                    RestartDecision::Tripped
                } else {
                    RestartDecision::Allowed
                }
            }
            BreakerState::Open => {
                let recovered = self
                    .opened_at
                    .map(|at| now.saturating_duration_since(at) >= config.recovery)
                    .unwrap_or(true);
                if recovered {
                    self.state = BreakerState::HalfOpen;
                    self.probe_started_at = Some(now);
                    RestartDecision::Probe
                } else {
                    RestartDecision::Denied
                }
            }
            BreakerState::HalfOpen => RestartDecision::Denied,
        }
    }

    pub fn record_probe_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            self.failures.clear();
            self.opened_at = None;
            self.probe_started_at = None;
        }
    }

    fn open_at(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.probe_started_at = None;
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// All breakers of the daemon, keyed by agent.
pub struct BreakerBoard {
    config: BreakerConfig,
    breakers: Mutex<HashMap<AgentKey, CircuitBreaker>>,
}

impl BreakerBoard {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record_failure(&self, key: &AgentKey) {
        let mut breakers = self.breakers.lock().await;
        breakers.entry(key.clone()).or_default().record_failure();
    }

    /// Consults the breaker for `key`. `config` overrides the board's
    /// thresholds for this call only.
    pub async fn check_restart_allowed(
        &self,
        key: &AgentKey,
        config: Option<&BreakerConfig>,
    ) -> RestartDecision {
        let config = config.unwrap_or(&self.config);
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(key.clone())
            .or_default()
            .check_restart_allowed(config)
    }

    pub async fn record_probe_success(&self, key: &AgentKey) {
        if let Some(b) = self.breakers.lock().await.get_mut(key) {
            b.record_probe_success();
        }
    }

    pub async fn state(&self, key: &AgentKey) -> BreakerState {
        self.breakers
            .lock()
            .await
            .get(key)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Agents whose half-open probe has been running for at least `grace`.
    pub async fn probes_older_than(&self, project_id: i64, grace: Duration) -> Vec<AgentKey> {
        let now = Instant::now();
        self.breakers
            .lock()
            .await
            .iter()
            .filter(|(key, b)| {
                key.project_id == project_id
                    && b.state() == BreakerState::HalfOpen
                    && b.probe_started_at()
                        .map(|at| now.saturating_duration_since(at) >= grace)
                        .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub async fn clear_project(&self, project_id: i64) {
        self.breakers
            .lock()
            .await
            .retain(|key, _| key.project_id != project_id);
    }
}
