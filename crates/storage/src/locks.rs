#![forbid(unsafe_code)]

use super::*;
use crate::tasks::load_task;

impl SqliteStore {
    /// Acquires the per-task advisory lock for one cycle. A held lock fails
    /// `TaskBusy` immediately; callers do not wait.
    pub fn acquire_task_lock(&mut self, task_id: &str, cycle_id: &str) -> Result<(), StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let Some(task) = load_task(&tx, task_id)? else {
            return Err(StoreError::UnknownTask(task_id.to_string()));
        };

        let holder: Option<String> = tx
            .query_row(
                "SELECT cycle_id FROM task_locks WHERE task_id = ?1",
                params![task.id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(holder) = holder {
            return Err(StoreError::TaskBusy {
                task_id: task.id,
                holder,
            });
        }

        tx.execute(
            "INSERT INTO task_locks(task_id, cycle_id, acquired_at_ms) VALUES (?1, ?2, ?3)",
            params![task.id, cycle_id, now_ms],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Releases the lock if this cycle still holds it. Releasing a lock that
    /// was never acquired (or was force-cleared) is a no-op, so release is
    /// safe on every exit path.
    pub fn release_task_lock(&mut self, task_id: &str, cycle_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM task_locks WHERE task_id = ?1 AND cycle_id = ?2",
            params![task_id, cycle_id],
        )?;
        Ok(())
    }

    /// Operator escape hatch: clears a lock regardless of holder.
    pub fn force_release_task_lock(&mut self, task_id: &str) -> Result<bool, StoreError> {
        let cleared = self.conn.execute(
            "DELETE FROM task_locks WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(cleared > 0)
    }
}
