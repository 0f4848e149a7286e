#![forbid(unsafe_code)]

use super::*;
use crate::tasks::load_task;

const ARTIFACT_COLUMNS: &str = "id, task_id, name, version, content, meta, created_at_ms";

impl SqliteStore {
    /// Creates the next version of `(task_id, name)`. Versions are allocated
    /// inside the transaction, so they stay contiguous from 1 under
    /// concurrent writers.
    pub fn upsert_artifact(
        &mut self,
        task_id: &str,
        name: &str,
        content: &str,
        meta_json: Option<&str>,
    ) -> Result<ArtifactRow, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("artifact name must not be empty"));
        }

        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let Some(task) = load_task(&tx, task_id)? else {
            return Err(StoreError::UnknownTask(task_id.to_string()));
        };

        let max_version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM artifacts WHERE task_id = ?1 AND name = ?2",
            params![task.id, name],
            |row| row.get(0),
        )?;
        let version = max_version + 1;

        let seq = next_counter_tx(&tx, "artifact_seq")?;
        let id = format!("ART-{seq:06}");

        tx.execute(
            r#"
            INSERT INTO artifacts(id, task_id, name, version, content, meta, created_at_ms)
            VALUES (?1,?2,?3,?4,?5,?6,?7)
            "#,
            params![id, task.id, name, version, content, meta_json, now_ms],
        )?;
        tx.commit()?;

        Ok(ArtifactRow {
            id,
            task_id: task.id,
            name: name.to_string(),
            version,
            content: content.to_string(),
            meta_json: meta_json.map(|s| s.to_string()),
            created_at_ms: now_ms,
        })
    }

    /// `version` of `None` or `Some(0)` means latest.
    pub fn get_artifact(
        &self,
        task_id: &str,
        name: &str,
        version: Option<i64>,
    ) -> Result<ArtifactRow, StoreError> {
        let version = version.unwrap_or(0);
        if version < 0 {
            return Err(StoreError::InvalidInput("artifact version must be >= 0"));
        }
        let row = if version == 0 {
            self.conn
                .query_row(
                    &format!(
                        "SELECT {ARTIFACT_COLUMNS} FROM artifacts \
                         WHERE task_id = ?1 AND name = ?2 ORDER BY version DESC LIMIT 1"
                    ),
                    params![task_id, name],
                    artifact_row_from,
                )
                .optional()?
        } else {
            self.conn
                .query_row(
                    &format!(
                        "SELECT {ARTIFACT_COLUMNS} FROM artifacts \
                         WHERE task_id = ?1 AND name = ?2 AND version = ?3"
                    ),
                    params![task_id, name, version],
                    artifact_row_from,
                )
                .optional()?
        };
        row.ok_or_else(|| StoreError::UnknownArtifact {
            task_id: task_id.to_string(),
            name: name.to_string(),
            version,
        })
    }

    /// All versions, grouped by name, newest version first within a name.
    pub fn list_artifacts(&self, task_id: &str) -> Result<Vec<ArtifactRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE task_id = ?1 \
             ORDER BY name ASC, version DESC"
        ))?;
        collect_artifacts(stmt.query_map(params![task_id], artifact_row_from)?)
    }

    /// The latest version of each artifact name — the rehydration view.
    pub fn latest_artifacts(&self, task_id: &str) -> Result<Vec<ArtifactRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts a \
             WHERE task_id = ?1 AND version = \
               (SELECT MAX(version) FROM artifacts b WHERE b.task_id = a.task_id AND b.name = a.name) \
             ORDER BY name ASC"
        ))?;
        collect_artifacts(stmt.query_map(params![task_id], artifact_row_from)?)
    }

    /// Artifacts created inside a cycle's wall-clock window, for the
    /// handshake's creation report.
    pub fn artifacts_created_since(
        &self,
        task_id: &str,
        since_ms: i64,
    ) -> Result<Vec<ArtifactRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts \
             WHERE task_id = ?1 AND created_at_ms >= ?2 ORDER BY name ASC, version ASC"
        ))?;
        collect_artifacts(stmt.query_map(params![task_id, since_ms], artifact_row_from)?)
    }
}

pub(crate) fn latest_artifact_tx(
    conn: &Connection,
    task_id: &str,
    name: &str,
) -> Result<Option<ArtifactRow>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {ARTIFACT_COLUMNS} FROM artifacts \
                 WHERE task_id = ?1 AND name = ?2 ORDER BY version DESC LIMIT 1"
            ),
            params![task_id, name],
            artifact_row_from,
        )
        .optional()?;
    Ok(row)
}

fn collect_artifacts(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow>>,
) -> Result<Vec<ArtifactRow>, StoreError> {
    let mut artifacts = Vec::new();
    for row in rows {
        artifacts.push(row?);
    }
    Ok(artifacts)
}

fn artifact_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok(ArtifactRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        content: row.get(4)?,
        meta_json: row.get(5)?,
        created_at_ms: row.get(6)?,
    })
}
