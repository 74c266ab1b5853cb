use anyhow::Result;
use rusqlite::params;
use rusqlite::types::Value;

use super::types::{EventPage, EventQuery, EventRecord, NewEvent};
use super::{Store, now_timestamp};

impl Store {
    pub async fn append_event(&self, event: &NewEvent) -> Result<EventRecord> {
        let db = self.db.lock().await;
        let timestamp = now_timestamp();
        db.execute(
            "INSERT INTO events (project_id, run_id, agent_name, event_type, detail, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.project_id,
                event.run_id,
                event.agent_name,
                event.event_type,
                event.detail,
                timestamp
            ],
        )?;
        Ok(EventRecord {
            id: db.last_insert_rowid(),
            project_id: event.project_id,
            run_id: event.run_id,
            agent_name: event.agent_name.clone(),
            event_type: event.event_type.clone(),
            detail: event.detail.clone(),
            timestamp,
        })
    }

    /// Filtered page of a project's events, newest first, together with the
    /// number of rows matching the filter before paging.
    pub async fn query_events(&self, project_id: i64, query: &EventQuery) -> Result<EventPage> {
        let mut clauses = vec!["project_id = ?".to_string()];
        let mut args: Vec<Value> = vec![Value::Integer(project_id)];

        if let Some(agent) = &query.agent {
            clauses.push("agent_name = ?".to_string());
            args.push(Value::Text(agent.clone()));
        }
        if let Some(kind) = &query.event_type {
            clauses.push("event_type = ?".to_string());
            args.push(Value::Text(kind.clone()));
        }
        if let Some(since) = &query.since {
            clauses.push("timestamp >= ?".to_string());
            args.push(Value::Text(since.clone()));
        }
        if let Some(until) = &query.until {
            clauses.push("timestamp <= ?".to_string());
            args.push(Value::Text(until.clone()));
        }
        let where_clause = clauses.join(" AND ");

        let db = self.db.lock().await;
        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM events WHERE {where_clause}"),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let mut page_args = args;
        page_args.push(Value::Integer(query.effective_limit() as i64));
        page_args.push(Value::Integer(query.effective_offset() as i64));

        let mut stmt = db.prepare(&format!(
            "SELECT id, project_id, run_id, agent_name, event_type, detail, timestamp
             FROM events WHERE {where_clause}
             ORDER BY id DESC LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(page_args.iter()), |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                project_id: row.get(1)?,
                run_id: row.get(2)?,
                agent_name: row.get(3)?,
                event_type: row.get(4)?,
                detail: row.get(5)?,
                timestamp: row.get(6)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(EventPage {
            events,
            total: total as usize,
        })
    }
}
