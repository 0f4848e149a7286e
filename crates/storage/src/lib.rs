#![forbid(unsafe_code)]

//! Durable store for tasks, requirements, artifacts, notes and audit entries.
//!
//! One SQLite database in WAL mode. Every mutation is a single transaction;
//! nothing here holds a transaction open across calls, so surface calls and
//! engine bookkeeping never hold locks while an agent is thinking.

mod artifacts;
mod audit;
mod error;
mod locks;
mod requirements;
mod tasks;
mod transition;
mod types;

pub use error::StoreError;
pub use types::*;

use cd_core::state::TaskState;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
    conn: Connection,
}

impl SqliteStore {
    /// Opens (and migrates) the database at `db_path`, creating parent
    /// directories as needed. Safe to call from multiple connections; the
    /// schema is idempotent and WAL handles concurrent readers.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        // The engine and the surface thread each hold a connection; writes
        // must wait out each other's transactions instead of failing busy.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self { db_path, conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Allocates the next cycle identifier (`CYC-000001`, ...).
    pub fn next_cycle_id(&mut self) -> Result<String, StoreError> {
        let tx = self.conn.transaction()?;
        let seq = next_counter_tx(&tx, "cycle_seq")?;
        tx.commit()?;
        Ok(format!("CYC-{seq:06}"))
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS counters (
              name TEXT PRIMARY KEY,
              value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
              id TEXT PRIMARY KEY,
              title TEXT NOT NULL,
              description TEXT,
              state TEXT NOT NULL DEFAULT 'ready_for_plan',
              priority INTEGER NOT NULL DEFAULT 5,
              owner TEXT,
              tags TEXT NOT NULL DEFAULT '[]',
              dependencies TEXT NOT NULL DEFAULT '[]',
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS requirements (
              id TEXT PRIMARY KEY,
              key TEXT NOT NULL UNIQUE,
              title TEXT NOT NULL,
              text TEXT NOT NULL,
              kind TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_requirements (
              task_id TEXT NOT NULL,
              requirement_id TEXT NOT NULL,
              PRIMARY KEY (task_id, requirement_id),
              FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE,
              FOREIGN KEY (requirement_id) REFERENCES requirements(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS artifacts (
              id TEXT PRIMARY KEY,
              task_id TEXT NOT NULL,
              name TEXT NOT NULL,
              version INTEGER NOT NULL,
              content TEXT NOT NULL,
              meta TEXT,
              created_at_ms INTEGER NOT NULL,
              UNIQUE (task_id, name, version),
              FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS task_notes (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              task_id TEXT NOT NULL,
              ts_ms INTEGER NOT NULL,
              actor TEXT,
              note TEXT NOT NULL,
              FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS agents (
              role TEXT PRIMARY KEY,
              description TEXT,
              allowed_states TEXT NOT NULL DEFAULT '[]',
              can_transition_to TEXT NOT NULL DEFAULT '[]',
              can_read_plan INTEGER NOT NULL DEFAULT 0,
              can_execute_commands INTEGER NOT NULL DEFAULT 0,
              can_update_artifacts INTEGER NOT NULL DEFAULT 0,
              prompt_template TEXT,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_logs (
              id TEXT PRIMARY KEY,
              cycle_id TEXT NOT NULL,
              task_id TEXT NOT NULL,
              prev_state TEXT,
              next_state TEXT,
              actor TEXT,
              selection_reason TEXT,
              inputs_summary TEXT,
              outputs_summary TEXT,
              commands TEXT NOT NULL DEFAULT '[]',
              result TEXT NOT NULL,
              note TEXT,
              follow_ups TEXT NOT NULL DEFAULT '[]',
              created_at_ms INTEGER NOT NULL,
              FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS task_locks (
              task_id TEXT PRIMARY KEY,
              cycle_id TEXT NOT NULL,
              acquired_at_ms INTEGER NOT NULL,
              FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
            CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority);
            CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks(updated_at_ms);
            CREATE INDEX IF NOT EXISTS idx_requirements_key ON requirements(key);
            CREATE INDEX IF NOT EXISTS idx_requirements_kind ON requirements(kind);
            CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_id, name, version);
            CREATE INDEX IF NOT EXISTS idx_task_notes_task ON task_notes(task_id, seq);
            CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_logs(task_id, created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_audit_cycle ON audit_logs(cycle_id);
            CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_logs(created_at_ms);
            "#,
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params!["schema_version", "v1"],
        )?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis().min(i64::MAX as u128) as i64
}

fn next_counter_tx(tx: &Transaction<'_>, name: &str) -> Result<i64, StoreError> {
    let current: i64 = tx
        .query_row(
            "SELECT value FROM counters WHERE name=?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let next = current + 1;
    tx.execute(
        r#"
        INSERT INTO counters(name, value) VALUES (?1, ?2)
        ON CONFLICT(name) DO UPDATE SET value=excluded.value
        "#,
        params![name, next],
    )?;
    Ok(next)
}

fn decode_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn encode_string_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_state_or_default(raw: &str) -> TaskState {
    TaskState::parse(raw).unwrap_or(TaskState::ReadyForPlan)
}
