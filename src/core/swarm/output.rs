//! Output capture for agent processes.
//!
//! Each agent stream gets its own reader task. Lines land in a bounded
//! per-agent buffer, a bounded per-project combined buffer (prefixed with
//! the agent label) and, optionally, the agent's on-disk log.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{EventKind, EventLog};
use super::types::{AgentKey, AgentName};
use crate::core::config::OutputConfig;

/// A ring buffer of recent lines that remembers how many lines it has
/// ever seen. Offsets are cumulative, so pagination stays stable while
/// old lines are evicted.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    total: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutputPage {
    pub lines: Vec<String>,
    pub total: usize,
    pub next_offset: usize,
    pub has_more: bool,
}

impl OutputPage {
    fn empty(offset: usize) -> Self {
        Self {
            lines: Vec::new(),
            total: 0,
            next_offset: offset,
            has_more: false,
        }
    }
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total: 0,
        }
    }

    /// Appends a line and returns the new cumulative total.
    pub fn push(&mut self, line: String) -> usize {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.total += 1;
        self.total
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Cumulative offset of the oldest retained line.
    pub fn first_offset(&self) -> usize {
        self.total - self.lines.len()
    }

    /// Lines from cumulative `offset`. An offset that points at evicted
    /// lines is moved forward to the oldest retained line.
    pub fn page(&self, offset: usize, limit: usize) -> OutputPage {
        let start = offset.max(self.first_offset()).min(self.total);
        let skip = start - self.first_offset();
        let lines: Vec<String> = self.lines.iter().skip(skip).take(limit).cloned().collect();
        let next_offset = start + lines.len();
        OutputPage {
            has_more: next_offset < self.total,
            total: self.total,
            next_offset,
            lines,
        }
    }

    /// The retained lines together with the cumulative offset of the first one.
    pub fn snapshot(&self) -> (usize, Vec<String>) {
        (self.first_offset(), self.lines.iter().cloned().collect())
    }
}

type SharedBuffer = Arc<Mutex<OutputBuffer>>;

/// Registry of output buffers plus the reader tasks that fill them.
///
/// Lock order: the map locks are only held to look up or insert an `Arc`,
/// never while a buffer lock is held.
pub struct OutputHub {
    agents: Mutex<HashMap<AgentKey, SharedBuffer>>,
    projects: Mutex<HashMap<i64, SharedBuffer>>,
    agent_capacity: usize,
    project_capacity: usize,
    milestone_every: usize,
    write_logs: bool,
    live_readers: Arc<AtomicUsize>,
}

/// Where a reader sends what it reads.
pub struct ReaderTarget {
    pub key: AgentKey,
    pub run_id: i64,
    pub log_path: Option<PathBuf>,
}

impl OutputHub {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            projects: Mutex::new(HashMap::new()),
            agent_capacity: config.agent_buffer_lines,
            project_capacity: config.project_buffer_lines,
            milestone_every: config.milestone_every.max(1),
            write_logs: config.write_logs,
            live_readers: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn agent_buffer(&self, key: &AgentKey) -> SharedBuffer {
        let mut agents = self.agents.lock().await;
        agents
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(OutputBuffer::new(self.agent_capacity))))
            .clone()
    }

    async fn project_buffer(&self, project_id: i64) -> SharedBuffer {
        let mut projects = self.projects.lock().await;
        projects
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(OutputBuffer::new(self.project_capacity))))
            .clone()
    }

    async fn existing(&self, project_id: i64, agent: Option<&AgentName>) -> Option<SharedBuffer> {
        match agent {
            Some(name) => {
                let key = AgentKey::new(project_id, name.clone());
                self.agents.lock().await.get(&key).cloned()
            }
            None => self.projects.lock().await.get(&project_id).cloned(),
        }
    }

    pub async fn page(
        &self,
        project_id: i64,
        agent: Option<&AgentName>,
        offset: usize,
        limit: usize,
    ) -> OutputPage {
        match self.existing(project_id, agent).await {
            Some(buf) => buf.lock().await.page(offset, limit),
            None => OutputPage::empty(offset),
        }
    }

    pub async fn snapshot(&self, project_id: i64, agent: Option<&AgentName>) -> (usize, Vec<String>) {
        match self.existing(project_id, agent).await {
            Some(buf) => buf.lock().await.snapshot(),
            None => (0, Vec::new()),
        }
    }

    /// Cumulative lines captured for one agent.
    pub async fn line_count(&self, key: &AgentKey) -> usize {
        let buf = self.agents.lock().await.get(key).cloned();
        match buf {
            Some(buf) => buf.lock().await.total(),
            None => 0,
        }
    }

    /// Cumulative lines captured across the whole project.
    pub async fn project_line_count(&self, project_id: i64) -> usize {
        let buf = self.projects.lock().await.get(&project_id).cloned();
        match buf {
            Some(buf) => buf.lock().await.total(),
            None => 0,
        }
    }

    /// Drops every buffer belonging to a project.
    pub async fn clear_project(&self, project_id: i64) {
        self.agents
            .lock()
            .await
            .retain(|key, _| key.project_id != project_id);
        self.projects.lock().await.remove(&project_id);
    }

    pub fn live_readers(&self) -> usize {
        self.live_readers.load(Ordering::SeqCst)
    }

    /// Starts a reader task for one agent stream. The task ends on EOF, on
    /// a read error, or when `cancel` fires, and always deregisters itself.
    pub async fn spawn_reader<R>(
        &self,
        target: ReaderTarget,
        stream: R,
        events: EventLog,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let agent_buf = self.agent_buffer(&target.key).await;
        let project_buf = self.project_buffer(target.key.project_id).await;
        let milestone_every = self.milestone_every;
        let log_path = if self.write_logs {
            target.log_path.clone()
        } else {
            None
        };

        self.live_readers.fetch_add(1, Ordering::SeqCst);
        let guard = ReaderGuard(self.live_readers.clone());

        tokio::spawn(async move {
            let _guard = guard;
            let ReaderTarget { key, run_id, .. } = target;
            let prefix = format!("[{}] ", key.name);

            let mut log_file = match log_path {
                Some(path) => open_log(&path).await,
                None => None,
            };

            let mut reader = BufReader::new(stream);
            let mut raw = Vec::with_capacity(256);
            loop {
                raw.clear();
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = reader.read_until(b'\n', &mut raw) => r,
                };
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(agent = %key.name, project_id = key.project_id, "reader stopped: {}", e);
                        break;
                    }
                }

                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();

                let write_err = match log_file.as_mut() {
                    Some(file) => file.write_all(format!("{line}\n").as_bytes()).await.err(),
                    None => None,
                };
                if let Some(e) = write_err {
                    warn!(agent = %key.name, "Disabling log file after write error: {}", e);
                    log_file = None;
                }

                let total = agent_buf.lock().await.push(line.clone());
                project_buf.lock().await.push(format!("{prefix}{line}"));

                if total % milestone_every == 0 {
                    events
                        .emit(
                            key.project_id,
                            Some(run_id),
                            key.name.as_str(),
                            EventKind::OutputMilestone,
                            format!("{total} lines"),
                        )
                        .await;
                }
            }

            if let Some(mut file) = log_file {
                let _ = file.flush().await;
            }
        })
    }
}

struct ReaderGuard(Arc<AtomicUsize>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn open_log(path: &std::path::Path) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!("Cannot open agent log {}: {}", path.display(), e);
            None
        }
    }
}
