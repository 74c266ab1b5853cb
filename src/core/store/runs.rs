use anyhow::Result;
use rusqlite::params;

use super::types::RunRecord;
use super::{Store, now_timestamp};
use crate::core::swarm::guardrails::GuardrailResult;
use crate::core::swarm::types::RunStatus;

const RUN_COLUMNS: &str = "id, project_id, started_at, ended_at, status, agent_count, max_phases, summary_json, guardrail_json";

type RunRow = (
    i64,
    i64,
    String,
    Option<String>,
    String,
    i64,
    i64,
    Option<String>,
    Option<String>,
);

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_record(row: RunRow) -> Result<RunRecord> {
    let (id, project_id, started_at, ended_at, status, agent_count, max_phases, summary, guardrails) =
        row;
    let summary = summary.map(|s| serde_json::from_str(&s)).transpose()?;
    let guardrail_results = match guardrails {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    Ok(RunRecord {
        id,
        project_id,
        started_at,
        ended_at,
        status,
        agent_count,
        max_phases,
        summary,
        guardrail_results,
    })
}

impl Store {
    pub async fn create_run(
        &self,
        project_id: i64,
        agent_count: usize,
        max_phases: usize,
    ) -> Result<RunRecord> {
        let db = self.db.lock().await;
        let started_at = now_timestamp();
        db.execute(
            "INSERT INTO runs (project_id, started_at, status, agent_count, max_phases) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                started_at,
                RunStatus::Running.as_str(),
                agent_count as i64,
                max_phases as i64
            ],
        )?;
        Ok(RunRecord {
            id: db.last_insert_rowid(),
            project_id,
            started_at,
            ended_at: None,
            status: RunStatus::Running.as_str().to_string(),
            agent_count: agent_count as i64,
            max_phases: max_phases as i64,
            summary: None,
            guardrail_results: Vec::new(),
        })
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![run_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(into_record(map_run(row)?)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list_runs(&self, project_id: i64, limit: usize) -> Result<Vec<RunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![project_id, limit as i64], map_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(into_record(row?)?);
        }
        Ok(out)
    }

    /// Moves a run out of `running` into a terminal status. Returns false when
    /// the run is unknown or already terminal, so a run finalizes at most once.
    pub async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        summary: &serde_json::Value,
        guardrail_results: &[GuardrailResult],
    ) -> Result<bool> {
        if !RunStatus::Running.can_transition(status) {
            return Ok(false);
        }
        let summary_json = serde_json::to_string(summary)?;
        let guardrail_json = serde_json::to_string(guardrail_results)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE runs
             SET status = ?1, ended_at = ?2, summary_json = ?3, guardrail_json = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                now_timestamp(),
                summary_json,
                guardrail_json,
                run_id,
                RunStatus::Running.as_str()
            ],
        )?;
        Ok(rows > 0)
    }
}
