#![forbid(unsafe_code)]

//! The transition validator: the only code path that changes a task's state.
//!
//! Validation and the write happen inside one transaction; a rejected
//! transition leaves the store untouched.

use super::*;
use crate::artifacts::latest_artifact_tx;
use crate::tasks::{bump_task_updated_at_tx, load_task};
use cd_core::state::required_handover;

impl SqliteStore {
    pub fn validate_and_transition(
        &mut self,
        task_id: &str,
        requested_state: &str,
        note: Option<&str>,
        actor: Option<&str>,
    ) -> Result<TransitionOutcome, StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;

        let Some(task) = load_task(&tx, task_id)? else {
            return Err(StoreError::UnknownTask(task_id.to_string()));
        };

        let next = check_target_state(&task, requested_state)?;

        if next.is_work_state() {
            for dep_id in &task.dependencies {
                match load_task(&tx, dep_id)? {
                    Some(dep) if dep.state == TaskState::Done => {}
                    Some(dep) => {
                        return Err(StoreError::DependencyIncomplete {
                            task_id: task.id,
                            dep_id: dep.id,
                            dep_title: dep.title,
                            dep_state: Some(dep.state),
                        });
                    }
                    None => {
                        return Err(StoreError::DependencyIncomplete {
                            task_id: task.id,
                            dep_id: dep_id.clone(),
                            dep_title: String::new(),
                            dep_state: None,
                        });
                    }
                }
            }
        }

        if let Some(name) = required_handover(task.state, next) {
            match latest_artifact_tx(&tx, &task.id, name)? {
                None => {
                    return Err(StoreError::MissingHandover {
                        name,
                        from: task.state,
                        to: next,
                    });
                }
                Some(artifact) if artifact.content.trim().is_empty() => {
                    return Err(StoreError::EmptyHandover {
                        name,
                        from: task.state,
                        to: next,
                    });
                }
                Some(_) => {}
            }
        }

        tx.execute(
            "UPDATE tasks SET state = ?2 WHERE id = ?1",
            params![task.id, next.as_str()],
        )?;
        let updated_at_ms = bump_task_updated_at_tx(&tx, &task.id, task.updated_at_ms, now_ms)?;

        if let Some(note) = note {
            let note = note.trim();
            if !note.is_empty() {
                tx.execute(
                    "INSERT INTO task_notes(task_id, ts_ms, actor, note) VALUES (?1, ?2, ?3, ?4)",
                    params![task.id, updated_at_ms, actor, note],
                )?;
            }
        }

        tx.commit()?;
        Ok(TransitionOutcome {
            task_id: task.id,
            from: task.state,
            to: next,
            updated_at_ms,
        })
    }

    /// The handshake's failure drop: forces the task into `needs_fixes` with
    /// an explanatory note. This is the single transition that bypasses the
    /// successor table — a stalled cycle must always land somewhere an
    /// operator can resume from, even from states whose successors do not
    /// include `needs_fixes`. A task already in `needs_fixes` is left alone.
    pub fn recovery_drop_to_needs_fixes(
        &mut self,
        task_id: &str,
        note: &str,
        actor: &str,
    ) -> Result<TransitionOutcome, StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let Some(task) = load_task(&tx, task_id)? else {
            return Err(StoreError::UnknownTask(task_id.to_string()));
        };

        if task.state == TaskState::NeedsFixes {
            return Ok(TransitionOutcome {
                task_id: task.id,
                from: TaskState::NeedsFixes,
                to: TaskState::NeedsFixes,
                updated_at_ms: task.updated_at_ms,
            });
        }

        tx.execute(
            "UPDATE tasks SET state = ?2 WHERE id = ?1",
            params![task.id, TaskState::NeedsFixes.as_str()],
        )?;
        let updated_at_ms = bump_task_updated_at_tx(&tx, &task.id, task.updated_at_ms, now_ms)?;
        tx.execute(
            "INSERT INTO task_notes(task_id, ts_ms, actor, note) VALUES (?1, ?2, ?3, ?4)",
            params![task.id, updated_at_ms, actor, note],
        )?;
        tx.commit()?;

        Ok(TransitionOutcome {
            task_id: task.id,
            from: task.state,
            to: TaskState::NeedsFixes,
            updated_at_ms,
        })
    }

    /// Read-only twin of `validate_and_transition`: classifies the same
    /// failures and lists what would need to change, without mutating.
    pub fn inspect_transition(
        &self,
        task_id: &str,
        requested_state: &str,
    ) -> Result<TransitionReport, StoreError> {
        let Some(task) = load_task(&self.conn, task_id)? else {
            return Err(StoreError::UnknownTask(task_id.to_string()));
        };

        let allowed = task.state.successors().to_vec();
        let next = match check_target_state(&task, requested_state) {
            Ok(next) => next,
            Err(err) => {
                return Ok(TransitionReport {
                    is_valid: false,
                    reason: Some(err.to_string()),
                    allowed,
                    dependencies_blocked: Vec::new(),
                    missing_handovers: Vec::new(),
                });
            }
        };

        let mut dependencies_blocked = Vec::new();
        if next.is_work_state() {
            for dep_id in &task.dependencies {
                match load_task(&self.conn, dep_id)? {
                    Some(dep) if dep.state == TaskState::Done => {}
                    Some(dep) => dependencies_blocked
                        .push(format!("{} ({}): {}", dep.id, dep.title, dep.state)),
                    None => dependencies_blocked.push(format!("{dep_id}: not found")),
                }
            }
        }

        let mut missing_handovers = Vec::new();
        if let Some(name) = required_handover(task.state, next) {
            let latest = latest_artifact_tx(&self.conn, &task.id, name)?;
            let satisfied = latest.is_some_and(|a| !a.content.trim().is_empty());
            if !satisfied {
                missing_handovers.push(name);
            }
        }

        let is_valid = dependencies_blocked.is_empty() && missing_handovers.is_empty();
        let reason = if is_valid {
            None
        } else if !dependencies_blocked.is_empty() {
            Some(format!(
                "blocked by {} dependencies",
                dependencies_blocked.len()
            ))
        } else {
            Some(format!(
                "missing {} required handovers",
                missing_handovers.len()
            ))
        };

        Ok(TransitionReport {
            is_valid,
            reason,
            allowed,
            dependencies_blocked,
            missing_handovers,
        })
    }
}

fn check_target_state(task: &TaskRow, requested: &str) -> Result<TaskState, StoreError> {
    let allowed = task.state.successors().to_vec();
    let Some(next) = TaskState::parse(requested) else {
        return Err(StoreError::IllegalTransition {
            from: task.state,
            requested: requested.to_string(),
            allowed,
        });
    };
    if !task.state.allows(next) {
        return Err(StoreError::IllegalTransition {
            from: task.state,
            requested: next.as_str().to_string(),
            allowed,
        });
    }
    Ok(next)
}
