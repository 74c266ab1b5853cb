//! Operator directives delivered to workers through per-agent mailbox files.
//!
//! A directive is pending for as long as its file exists. Workers read and
//! delete the file; the supervisor notices the removal on a later tick.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::events::{EventKind, EventLog};
use super::paths::ProjectPaths;
use super::types::{AgentKey, AgentName, Priority};
use crate::core::error::{SwarmError, SwarmResult};
use crate::core::store::now_timestamp;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub agent: String,
    pub text: String,
    pub priority: Priority,
    pub queued_at: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PendingDirective {
    pub pending: bool,
    pub text: Option<String>,
    pub priority: Option<Priority>,
    pub queued_at: Option<String>,
}

struct KnownDirective {
    path: PathBuf,
    run_id: Option<i64>,
}

pub struct DirectiveChannel {
    events: EventLog,
    max_len: usize,
    known: Mutex<HashMap<AgentKey, KnownDirective>>,
}

/// Strips control characters other than newline and tab, trims, and
/// enforces the length limit (in characters).
pub fn sanitize(text: &str, max_len: usize) -> SwarmResult<String> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        return Err(SwarmError::validation("directive text is empty"));
    }
    let len = cleaned.chars().count();
    if len > max_len {
        return Err(SwarmError::validation(format!(
            "directive is {len} characters, limit is {max_len}"
        )));
    }
    Ok(cleaned)
}

impl DirectiveChannel {
    pub fn new(events: EventLog, max_len: usize) -> Self {
        Self {
            events,
            max_len,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Writes the mailbox file for `agent`, replacing any unconsumed
    /// directive, and records `directive_queued`.
    pub async fn send(
        &self,
        project_id: i64,
        run_id: Option<i64>,
        paths: &ProjectPaths,
        agent: &AgentName,
        text: &str,
        priority: Priority,
    ) -> SwarmResult<Directive> {
        let text = sanitize(text, self.max_len)?;
        let directive = Directive {
            agent: agent.to_string(),
            text,
            priority,
            queued_at: now_timestamp(),
        };

        let path = paths.directive_file(agent);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&directive).map_err(anyhow::Error::from)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.known.lock().await.insert(
            AgentKey::new(project_id, agent.clone()),
            KnownDirective {
                path: path.clone(),
                run_id,
            },
        );

        info!(project_id, agent = %agent, priority = priority.as_str(), "Directive queued");
        self.events
            .emit(
                project_id,
                run_id,
                agent.as_str(),
                EventKind::DirectiveQueued,
                format!("{}: {}", priority.as_str(), preview(&directive.text)),
            )
            .await;
        Ok(directive)
    }

    /// Reports what is currently sitting in the agent's mailbox.
    pub async fn get_pending(&self, paths: &ProjectPaths, agent: &AgentName) -> PendingDirective {
        let path = paths.directive_file(agent);
        let Ok(raw) = tokio::fs::read(&path).await else {
            return PendingDirective::default();
        };
        match serde_json::from_slice::<Directive>(&raw) {
            Ok(d) => PendingDirective {
                pending: true,
                text: Some(d.text),
                priority: Some(d.priority),
                queued_at: Some(d.queued_at),
            },
            Err(e) => {
                warn!(agent = %agent, "Unreadable directive file {}: {}", path.display(), e);
                PendingDirective {
                    pending: true,
                    ..Default::default()
                }
            }
        }
    }

    /// Emits `directive_consumed` for every tracked directive of the
    /// project whose file has disappeared. Returns those agents.
    pub async fn poll_consumed(&self, project_id: i64) -> Vec<AgentName> {
        let candidates: Vec<(AgentKey, PathBuf)> = self
            .known
            .lock()
            .await
            .iter()
            .filter(|(key, _)| key.project_id == project_id)
            .map(|(key, known)| (key.clone(), known.path.clone()))
            .collect();

        let mut consumed = Vec::new();
        for (key, path) in candidates {
            if tokio::fs::try_exists(&path).await.unwrap_or(true) {
                continue;
            }
            let removed = self.known.lock().await.remove(&key);
            if let Some(known) = removed {
                self.events
                    .emit(
                        project_id,
                        known.run_id,
                        key.name.as_str(),
                        EventKind::DirectiveConsumed,
                        "",
                    )
                    .await;
                consumed.push(key.name);
            }
        }
        consumed
    }

    /// Starts tracking mailbox files that are already on disk, such as
    /// directives queued while no run was active, so their consumption is
    /// reported under `run_id`. Returns the adopted agents.
    pub async fn adopt_existing(
        &self,
        project_id: i64,
        run_id: i64,
        paths: &ProjectPaths,
    ) -> Vec<AgentName> {
        let mut found = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(paths.directives_dir()).await else {
            return Vec::new();
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(agent) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|stem| AgentName::parse(stem).ok())
            else {
                continue;
            };
            found.push((agent, entry.path()));
        }

        let mut known = self.known.lock().await;
        let mut adopted = Vec::with_capacity(found.len());
        for (agent, path) in found {
            debug!(project_id, run_id, agent = %agent, "Tracking queued directive");
            known.insert(
                AgentKey::new(project_id, agent.clone()),
                KnownDirective {
                    path,
                    run_id: Some(run_id),
                },
            );
            adopted.push(agent);
        }
        adopted.sort_by_key(|a| a.index());
        adopted
    }

    pub async fn clear_project(&self, project_id: i64) {
        self.known
            .lock()
            .await
            .retain(|key, _| key.project_id != project_id);
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() > MAX {
        let cut: String = first_line.chars().take(MAX).collect();
        format!("{cut}...")
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{EventQuery, Store};

    fn setup() -> (tempfile::TempDir, ProjectPaths, Store, DirectiveChannel) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        let store = Store::in_memory();
        let channel = DirectiveChannel::new(EventLog::new(store.clone()), 64);
        (dir, paths, store, channel)
    }

    #[test]
    fn sanitize_strips_control_chars_and_limits_length() {
        assert_eq!(
            sanitize("  fix\u{7}\tthe\nbuild\u{1b}  ", 100).unwrap(),
            "fix\tthe\nbuild"
        );
        assert!(sanitize(" \u{0} ", 100).is_err());
        assert!(sanitize("abcdef", 5).is_err());
        assert_eq!(sanitize("éééé", 4).unwrap(), "éééé");
    }

    #[tokio::test]
    async fn send_then_consume_round_trip() {
        let (_dir, paths, store, channel) = setup();
        let w1 = AgentName::parse("W-1").unwrap();

        channel
            .send(1, Some(4), &paths, &w1, "switch to the parser", Priority::Normal)
            .await
            .unwrap();
        let pending = channel.get_pending(&paths, &w1).await;
        assert!(pending.pending);
        assert_eq!(pending.text.as_deref(), Some("switch to the parser"));
        assert!(channel.poll_consumed(1).await.is_empty());

        std::fs::remove_file(paths.directive_file(&w1)).unwrap();
        assert!(!channel.get_pending(&paths, &w1).await.pending);
        assert_eq!(channel.poll_consumed(1).await, vec![w1.clone()]);
        // Reported once only.
        assert!(channel.poll_consumed(1).await.is_empty());

        let q = EventQuery {
            event_type: Some("directive_consumed".to_string()),
            ..Default::default()
        };
        assert_eq!(store.query_events(1, &q).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn mailboxes_left_on_disk_are_tracked_after_a_reset() {
        let (_dir, paths, store, channel) = setup();
        let w1 = AgentName::parse("W-1").unwrap();
        let w3 = AgentName::parse("W-3").unwrap();
        channel
            .send(1, None, &paths, &w3, "read the notes", Priority::Normal)
            .await
            .unwrap();
        channel
            .send(1, None, &paths, &w1, "start with tests", Priority::Normal)
            .await
            .unwrap();
        std::fs::write(paths.directives_dir().join("notes.json"), "{}").unwrap();
        channel.clear_project(1).await;

        assert_eq!(channel.adopt_existing(1, 9, &paths).await, vec![w1.clone(), w3]);
        std::fs::remove_file(paths.directive_file(&w1)).unwrap();
        assert_eq!(channel.poll_consumed(1).await, vec![w1]);

        let q = EventQuery {
            event_type: Some("directive_consumed".to_string()),
            ..Default::default()
        };
        let page = store.query_events(1, &q).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].run_id, Some(9));
    }

    #[tokio::test]
    async fn oversized_directive_writes_nothing() {
        let (_dir, paths, store, channel) = setup();
        let w2 = AgentName::parse("W-2").unwrap();
        let long = "x".repeat(65);
        assert!(
            channel
                .send(1, None, &paths, &w2, &long, Priority::Urgent)
                .await
                .is_err()
        );
        assert!(!paths.directive_file(&w2).exists());
        assert_eq!(
            store
                .query_events(1, &EventQuery::default())
                .await
                .unwrap()
                .total,
            0
        );
    }
}
