#![forbid(unsafe_code)]

use super::*;
use crate::tasks::load_task;

const AUDIT_COLUMNS: &str = "id, cycle_id, task_id, prev_state, next_state, actor, \
     selection_reason, inputs_summary, outputs_summary, commands, result, note, follow_ups, created_at_ms";

impl SqliteStore {
    /// Appends one audit entry. Entries are never edited or deleted while the
    /// task exists; deleting the task cascades.
    pub fn append_audit(&mut self, entry: NewAuditEntry) -> Result<AuditRow, StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let Some(task) = load_task(&tx, &entry.task_id)? else {
            return Err(StoreError::UnknownTask(entry.task_id.clone()));
        };

        let seq = next_counter_tx(&tx, "audit_seq")?;
        let id = format!("AUD-{seq:06}");

        tx.execute(
            r#"
            INSERT INTO audit_logs(id, cycle_id, task_id, prev_state, next_state, actor,
                selection_reason, inputs_summary, outputs_summary, commands, result, note,
                follow_ups, created_at_ms)
            VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
            "#,
            params![
                id,
                entry.cycle_id,
                task.id,
                entry.prev_state.map(|s| s.as_str()),
                entry.next_state.map(|s| s.as_str()),
                entry.actor,
                entry.selection_reason,
                entry.inputs_summary,
                entry.outputs_summary,
                entry.commands_json,
                entry.result.as_str(),
                entry.note,
                entry.follow_ups_json,
                now_ms
            ],
        )?;
        tx.commit()?;

        Ok(AuditRow {
            id,
            cycle_id: entry.cycle_id,
            task_id: task.id,
            prev_state: entry.prev_state.map(|s| s.as_str().to_string()),
            next_state: entry.next_state.map(|s| s.as_str().to_string()),
            actor: entry.actor,
            selection_reason: entry.selection_reason,
            inputs_summary: entry.inputs_summary,
            outputs_summary: entry.outputs_summary,
            commands_json: entry.commands_json,
            result: entry.result.as_str().to_string(),
            note: entry.note,
            follow_ups_json: entry.follow_ups_json,
            created_at_ms: now_ms,
        })
    }

    /// Entries for one task, oldest first. Ids are counter-monotonic, so they
    /// break same-millisecond ties.
    pub fn audit_history(&self, task_id: &str) -> Result<Vec<AuditRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs WHERE task_id = ?1 \
             ORDER BY created_at_ms ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![task_id], audit_row_from)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn audit_recent(&self, limit: i64) -> Result<Vec<AuditRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs ORDER BY created_at_ms DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit.max(0)], audit_row_from)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn status_report(&self) -> Result<StatusReport, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state ORDER BY state ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut by_state = Vec::new();
        let mut total = 0i64;
        let mut completed = 0i64;
        for row in rows {
            let (state, count) = row?;
            total += count;
            if state == TaskState::Done.as_str() {
                completed = count;
            }
            by_state.push((state, count));
        }

        let completion_rate = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(StatusReport {
            total_tasks: total,
            by_state,
            completed,
            completion_rate,
        })
    }
}

fn audit_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        id: row.get(0)?,
        cycle_id: row.get(1)?,
        task_id: row.get(2)?,
        prev_state: row.get(3)?,
        next_state: row.get(4)?,
        actor: row.get(5)?,
        selection_reason: row.get(6)?,
        inputs_summary: row.get(7)?,
        outputs_summary: row.get(8)?,
        commands_json: row.get(9)?,
        result: row.get(10)?,
        note: row.get(11)?,
        follow_ups_json: row.get(12)?,
        created_at_ms: row.get(13)?,
    })
}
