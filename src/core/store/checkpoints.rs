use anyhow::Result;
use rusqlite::params;

use super::Store;
use super::types::{CheckpointRecord, NewCheckpoint};

impl Store {
    /// Inserts a whole batch inside one transaction. Either every row lands or none do.
    pub async fn insert_checkpoints(&self, batch: &[NewCheckpoint]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO checkpoints (project_id, run_id, agent_name, checkpoint_type, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for cp in batch {
                stmt.execute(params![
                    cp.project_id,
                    cp.run_id,
                    cp.agent_name,
                    cp.checkpoint_type,
                    cp.data,
                    cp.created_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(batch.len())
    }

    pub async fn list_checkpoints(&self, run_id: i64) -> Result<Vec<CheckpointRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, project_id, run_id, agent_name, checkpoint_type, data, created_at
             FROM checkpoints WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(CheckpointRecord {
                id: row.get(0)?,
                project_id: row.get(1)?,
                run_id: row.get(2)?,
                agent_name: row.get(3)?,
                checkpoint_type: row.get(4)?,
                data: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
