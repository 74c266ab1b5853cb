mod checkpoints;
mod events;
mod projects;
mod runs;
pub mod types;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

pub use types::{
    CheckpointRecord, EventPage, EventQuery, EventRecord, NewCheckpoint, NewEvent, ProjectRecord,
    RunRecord,
};

/// Relational store for projects, runs, lifecycle events and checkpoints.
///
/// A single connection guarded by an async mutex. Callers never hold the
/// guard across anything other than the SQLite call itself.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        folder TEXT NOT NULL,
        guardrails_json TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        status TEXT NOT NULL,
        agent_count INTEGER NOT NULL,
        max_phases INTEGER NOT NULL,
        summary_json TEXT,
        guardrail_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL,
        run_id INTEGER,
        agent_name TEXT NOT NULL,
        event_type TEXT NOT NULL,
        detail TEXT NOT NULL,
        timestamp TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL,
        run_id INTEGER NOT NULL,
        agent_name TEXT NOT NULL,
        checkpoint_type TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_runs_project_id ON runs(project_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_events_project_id_id ON events(project_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_run_id ON checkpoints(run_id, id)",
];

fn init_schema(db: &Connection) -> Result<()> {
    for stmt in SCHEMA {
        db.execute(stmt, [])?;
    }
    Ok(())
}

/// RFC 3339 UTC timestamp with millisecond precision. Lexicographic order
/// matches chronological order, which the event range filters rely on.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Store {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
            NativePlatform::restrict_dir_permissions(parent);
        }

        let db = Connection::open(db_path)?;
        NativePlatform::restrict_file_permissions(db_path);
        init_schema(&db)?;
        info!("Store opened at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store with the full schema. Avoids filesystem side-effects in tests.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        let db = Connection::open_in_memory().expect("open in-memory db");
        for stmt in SCHEMA {
            db.execute(stmt, []).expect("create schema");
        }
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Runs raw SQL against the connection, for tests that need to break
    /// the schema underneath a component.
    #[cfg(test)]
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.db.lock().await.execute_batch(sql)?;
        Ok(())
    }
}
