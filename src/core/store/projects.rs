use anyhow::Result;
use rusqlite::params;

use super::types::ProjectRecord;
use super::{Store, now_timestamp};
use crate::core::swarm::guardrails::GuardrailRule;

fn map_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn into_record(
    (id, name, folder, guardrails_json, created_at): (i64, String, String, String, String),
) -> Result<ProjectRecord> {
    Ok(ProjectRecord {
        id,
        name,
        folder,
        guardrails: serde_json::from_str(&guardrails_json)?,
        created_at,
    })
}

impl Store {
    pub async fn create_project(&self, name: &str, folder: &str) -> Result<ProjectRecord> {
        let db = self.db.lock().await;
        let created_at = now_timestamp();
        db.execute(
            "INSERT INTO projects (name, folder, guardrails_json, created_at) VALUES (?1, ?2, '[]', ?3)",
            params![name, folder, created_at],
        )?;
        Ok(ProjectRecord {
            id: db.last_insert_rowid(),
            name: name.to_string(),
            folder: folder.to_string(),
            guardrails: Vec::new(),
            created_at,
        })
    }

    pub async fn get_project(&self, project_id: i64) -> Result<Option<ProjectRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, folder, guardrails_json, created_at FROM projects WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![project_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(into_record(map_project(row)?)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, folder, guardrails_json, created_at FROM projects ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], map_project)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(into_record(row?)?);
        }
        Ok(out)
    }

    pub async fn set_guardrails(&self, project_id: i64, rules: &[GuardrailRule]) -> Result<bool> {
        let json = serde_json::to_string(rules)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE projects SET guardrails_json = ?1 WHERE id = ?2",
            params![json, project_id],
        )?;
        Ok(rows > 0)
    }
}
