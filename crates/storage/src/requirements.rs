#![forbid(unsafe_code)]

use super::*;
use crate::tasks::load_task;

const REQUIREMENT_COLUMNS: &str = "id, key, title, text, kind, created_at_ms, updated_at_ms";

impl SqliteStore {
    /// Inserts or refreshes a requirement by key. Ingest runs are idempotent:
    /// re-ingesting the same plan updates text in place instead of failing.
    pub fn upsert_requirement(
        &mut self,
        key: &str,
        title: &str,
        text: &str,
        kind: RequirementKind,
    ) -> Result<RequirementRow, StoreError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(StoreError::InvalidInput("requirement key must not be empty"));
        }

        let now_ms = now_ms();
        let tx = self.conn.transaction()?;

        let existing = load_requirement(&tx, key)?;
        let row = match existing {
            Some(current) => {
                tx.execute(
                    "UPDATE requirements SET title=?2, text=?3, kind=?4, updated_at_ms=?5 WHERE key=?1",
                    params![key, title, text, kind.as_str(), now_ms],
                )?;
                RequirementRow {
                    title: title.to_string(),
                    text: text.to_string(),
                    kind,
                    updated_at_ms: now_ms,
                    ..current
                }
            }
            None => {
                let seq = next_counter_tx(&tx, "requirement_seq")?;
                let id = format!("REQ-{seq:03}");
                tx.execute(
                    r#"
                    INSERT INTO requirements(id, key, title, text, kind, created_at_ms, updated_at_ms)
                    VALUES (?1,?2,?3,?4,?5,?6,?7)
                    "#,
                    params![id, key, title, text, kind.as_str(), now_ms, now_ms],
                )?;
                RequirementRow {
                    id,
                    key: key.to_string(),
                    title: title.to_string(),
                    text: text.to_string(),
                    kind,
                    created_at_ms: now_ms,
                    updated_at_ms: now_ms,
                }
            }
        };
        tx.commit()?;
        Ok(row)
    }

    pub fn get_requirement(&self, key: &str) -> Result<RequirementRow, StoreError> {
        load_requirement(&self.conn, key)?
            .ok_or_else(|| StoreError::UnknownRequirement(key.to_string()))
    }

    pub fn list_requirements(
        &self,
        kind: Option<RequirementKind>,
    ) -> Result<Vec<RequirementRow>, StoreError> {
        let mut sql = format!("SELECT {REQUIREMENT_COLUMNS} FROM requirements");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(kind) = kind {
            sql.push_str(" WHERE kind = ?");
            args.push(kind.as_str().to_string().into());
        }
        sql.push_str(" ORDER BY key ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), requirement_row_from)?;
        let mut requirements = Vec::new();
        for row in rows {
            requirements.push(row?);
        }
        Ok(requirements)
    }

    pub fn link_task_requirement(
        &mut self,
        task_id: &str,
        requirement_key: &str,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let Some(task) = load_task(&tx, task_id)? else {
            return Err(StoreError::UnknownTask(task_id.to_string()));
        };
        let Some(requirement) = load_requirement(&tx, requirement_key)? else {
            return Err(StoreError::UnknownRequirement(requirement_key.to_string()));
        };
        tx.execute(
            "INSERT OR IGNORE INTO task_requirements(task_id, requirement_id) VALUES (?1, ?2)",
            params![task.id, requirement.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn requirements_for_task(&self, task_id: &str) -> Result<Vec<RequirementRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT r.id, r.key, r.title, r.text, r.kind, r.created_at_ms, r.updated_at_ms \
             FROM requirements r \
             JOIN task_requirements tr ON tr.requirement_id = r.id \
             WHERE tr.task_id = ?1 ORDER BY r.key ASC"
        ))?;
        let rows = stmt.query_map(params![task_id], requirement_row_from)?;
        let mut requirements = Vec::new();
        for row in rows {
            requirements.push(row?);
        }
        Ok(requirements)
    }
}

fn load_requirement(conn: &Connection, key: &str) -> Result<Option<RequirementRow>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {REQUIREMENT_COLUMNS} FROM requirements WHERE key = ?1"),
            params![key],
            requirement_row_from,
        )
        .optional()?;
    Ok(row)
}

fn requirement_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequirementRow> {
    let kind: String = row.get(4)?;
    Ok(RequirementRow {
        id: row.get(0)?,
        key: row.get(1)?,
        title: row.get(2)?,
        text: row.get(3)?,
        kind: RequirementKind::parse(&kind).unwrap_or(RequirementKind::Functional),
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
    })
}
