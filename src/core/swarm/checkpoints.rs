use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::store::{NewCheckpoint, Store, now_timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    project_id: i64,
    agent: String,
    kind: String,
}

/// Debounced checkpoint accumulator.
///
/// At most one entry per (project, agent, type) is admitted per debounce
/// interval. Admitted entries sit in memory until `flush`, which writes the
/// whole batch in one transaction. A failed flush drops the batch.
///
/// Lock order: `cooldowns` before `batch`.
pub struct CheckpointBatcher {
    store: Store,
    debounce: Duration,
    cooldowns: Mutex<HashMap<CooldownKey, Instant>>,
    batch: Mutex<Vec<NewCheckpoint>>,
}

impl CheckpointBatcher {
    pub fn new(store: Store, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            cooldowns: Mutex::new(HashMap::new()),
            batch: Mutex::new(Vec::new()),
        }
    }

    pub async fn record(
        &self,
        project_id: i64,
        run_id: i64,
        agent: &str,
        kind: &str,
        data: serde_json::Value,
    ) -> bool {
        self.record_at(Instant::now(), project_id, run_id, agent, kind, data)
            .await
    }

    /// Returns whether the entry was admitted.
    pub async fn record_at(
        &self,
        now: Instant,
        project_id: i64,
        run_id: i64,
        agent: &str,
        kind: &str,
        data: serde_json::Value,
    ) -> bool {
        let key = CooldownKey {
            project_id,
            agent: agent.to_string(),
            kind: kind.to_string(),
        };
        let mut cooldowns = self.cooldowns.lock().await;
        if let Some(last) = cooldowns.get(&key)
            && now.saturating_duration_since(*last) < self.debounce
        {
            return false;
        }
        cooldowns.insert(key, now);

        self.batch.lock().await.push(NewCheckpoint {
            project_id,
            run_id,
            agent_name: agent.to_string(),
            checkpoint_type: kind.to_string(),
            data: data.to_string(),
            created_at: now_timestamp(),
        });
        true
    }

    pub async fn pending(&self) -> usize {
        self.batch.lock().await.len()
    }

    /// Persists everything accumulated so far. Returns the number of rows
    /// written; zero for an empty batch or a failed write.
    pub async fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.batch.lock().await);
        if batch.is_empty() {
            return 0;
        }
        match self.store.insert_checkpoints(&batch).await {
            Ok(n) => {
                debug!("Flushed {} checkpoints", n);
                n
            }
            Err(e) => {
                warn!(
                    batch_size = batch.len(),
                    "Dropping checkpoint batch after failed flush: {}", e
                );
                0
            }
        }
    }

    /// Forgets cooldowns for a project so the next run starts fresh.
    pub async fn clear_project(&self, project_id: i64) {
        self.cooldowns
            .lock()
            .await
            .retain(|key, _| key.project_id != project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA_CHECKPOINTS: &str = "CREATE TABLE checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL,
        run_id INTEGER NOT NULL,
        agent_name TEXT NOT NULL,
        checkpoint_type TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL
    )";

    fn batcher(store: Store) -> CheckpointBatcher {
        CheckpointBatcher::new(store, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn same_key_within_debounce_is_dropped() {
        let b = batcher(Store::in_memory());
        let t0 = Instant::now();
        assert!(b.record_at(t0, 1, 1, "W-1", "progress", json!({})).await);
        assert!(
            !b.record_at(t0 + Duration::from_secs(5), 1, 1, "W-1", "progress", json!({}))
                .await
        );
        assert_eq!(b.pending().await, 1);

        assert!(
            b.record_at(t0 + Duration::from_secs(31), 1, 1, "W-1", "progress", json!({}))
                .await
        );
        assert_eq!(b.pending().await, 2);
    }

    #[tokio::test]
    async fn differing_agent_or_type_get_their_own_entry() {
        let b = batcher(Store::in_memory());
        let t0 = Instant::now();
        assert!(b.record_at(t0, 1, 1, "W-1", "progress", json!({})).await);
        assert!(b.record_at(t0, 1, 1, "W-2", "progress", json!({})).await);
        assert!(b.record_at(t0, 1, 1, "W-1", "phase", json!({})).await);
        assert!(b.record_at(t0, 2, 1, "W-1", "progress", json!({})).await);
        assert_eq!(b.pending().await, 4);
    }

    #[tokio::test]
    async fn flush_persists_and_empties_batch() {
        let store = Store::in_memory();
        let b = batcher(store.clone());
        b.record(1, 7, "W-1", "progress", json!({ "percent": 40 }))
            .await;
        b.record(1, 7, "W-2", "progress", json!({ "percent": 10 }))
            .await;
        assert_eq!(b.flush().await, 2);
        assert_eq!(b.pending().await, 0);
        assert_eq!(b.flush().await, 0);

        let rows = store.list_checkpoints(7).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].data.contains("40"));
    }

    #[tokio::test]
    async fn failed_flush_drops_the_batch_without_retrying() {
        let store = Store::in_memory();
        let b = batcher(store.clone());
        b.record(1, 7, "W-1", "progress", json!({ "percent": 40 }))
            .await;
        b.record(1, 7, "W-2", "phase", json!({ "phase": 2 }))
            .await;
        store.execute_batch("DROP TABLE checkpoints").await.unwrap();

        assert_eq!(b.flush().await, 0);
        assert_eq!(b.pending().await, 0);

        store.execute_batch(SCHEMA_CHECKPOINTS).await.unwrap();
        assert_eq!(b.flush().await, 0);
        assert!(store.list_checkpoints(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_project_resets_cooldowns() {
        let b = batcher(Store::in_memory());
        let t0 = Instant::now();
        b.record_at(t0, 3, 1, "W-1", "progress", json!({})).await;
        b.clear_project(3).await;
        assert!(b.record_at(t0, 3, 2, "W-1", "progress", json!({})).await);
    }
}
