#![forbid(unsafe_code)]

//! Completion handshake: proof that the agent explicitly declared an outcome.
//!
//! The enforcer only ever reads, except for the final failure drop into
//! `needs_fixes` — the single automatic transition in the system.

use crate::config::CompletionConfig;
use cd_core::state::TaskState;
use cd_storage::{ArtifactRow, SqliteStore, StoreError};
use std::time::Duration;

/// One follow-up exchange, recorded verbatim into the audit entry.
#[derive(Clone, Debug)]
pub struct FollowUpRecord {
    pub message: String,
    pub outcome: String,
}

/// How the enforcer reaches the agent between retries. The engine wires this
/// to a fresh bounded runner invocation; tests plug in a script or a no-op.
pub trait FollowUpChannel {
    fn send(&mut self, message: &str) -> Result<(), String>;
}

/// Channel for contexts with no agent to poke (dry paths, unit tests).
pub struct NoFollowUp;

impl FollowUpChannel for NoFollowUp {
    fn send(&mut self, _message: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct HandshakeReport {
    pub success: bool,
    pub final_state: TaskState,
    pub artifacts_created: Vec<ArtifactRow>,
    pub follow_ups: Vec<FollowUpRecord>,
    pub note: String,
}

pub struct HandshakeEnforcer<'a> {
    config: &'a CompletionConfig,
}

impl<'a> HandshakeEnforcer<'a> {
    pub fn new(config: &'a CompletionConfig) -> Self {
        Self { config }
    }

    /// Verifies that the task moved off `initial_state`. Re-running against a
    /// task that already transitioned short-circuits to success, so the
    /// enforcer is idempotent.
    pub fn enforce(
        &self,
        store: &mut SqliteStore,
        task_id: &str,
        initial_state: TaskState,
        window_start_ms: i64,
        channel: &mut dyn FollowUpChannel,
    ) -> Result<HandshakeReport, StoreError> {
        let task = store.get_task(task_id)?;
        if task.state != initial_state {
            return Ok(HandshakeReport {
                success: true,
                final_state: task.state,
                artifacts_created: store.artifacts_created_since(task_id, window_start_ms)?,
                follow_ups: Vec::new(),
                note: "agent declared the state transition".to_string(),
            });
        }

        let mut follow_ups = Vec::new();
        for retry in 0..self.config.max_retries {
            let message = self.config.follow_up_template.clone();
            let outcome = match channel.send(&message) {
                Ok(()) => "sent".to_string(),
                Err(e) => format!("send failed: {e}"),
            };
            follow_ups.push(FollowUpRecord { message, outcome });

            if self.config.retry_delay_seconds > 0 {
                std::thread::sleep(Duration::from_secs(self.config.retry_delay_seconds));
            }

            let task = store.get_task(task_id)?;
            if task.state != initial_state {
                if let Some(last) = follow_ups.last_mut() {
                    last.outcome = "state_updated".to_string();
                }
                return Ok(HandshakeReport {
                    success: true,
                    final_state: task.state,
                    artifacts_created: store.artifacts_created_since(task_id, window_start_ms)?,
                    follow_ups,
                    note: format!("state declared after follow-up {}", retry + 1),
                });
            }
        }

        if !self.config.require_explicit_state_update {
            return Ok(HandshakeReport {
                success: false,
                final_state: initial_state,
                artifacts_created: store.artifacts_created_since(task_id, window_start_ms)?,
                follow_ups,
                note: "no state change detected; explicit updates not required".to_string(),
            });
        }

        let note = format!(
            "completion handshake failed after {} follow-ups: agent did not declare a state transition",
            self.config.max_retries
        );
        let outcome = store.recovery_drop_to_needs_fixes(task_id, &note, "handshake")?;
        Ok(HandshakeReport {
            success: false,
            final_state: outcome.to,
            artifacts_created: store.artifacts_created_since(task_id, window_start_ms)?,
            follow_ups,
            note,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cd_storage::NewTask;
    use std::path::PathBuf;

    fn temp_db(test_name: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = base.join(format!("cd_engine_hs_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir.join("cadence.db")
    }

    fn fast_config() -> CompletionConfig {
        CompletionConfig {
            max_retries: 2,
            retry_delay_seconds: 0,
            timeout_seconds: 600,
            require_explicit_state_update: true,
            follow_up_template: "Are you finished?".to_string(),
        }
    }

    fn seed(store: &mut SqliteStore, state: TaskState) -> String {
        store
            .create_task(NewTask {
                id: Some("T1".to_string()),
                title: "Task".to_string(),
                state: Some(state),
                ..NewTask::default()
            })
            .expect("seed task")
            .id
    }

    struct CountingChannel {
        sent: Vec<String>,
    }

    impl FollowUpChannel for CountingChannel {
        fn send(&mut self, message: &str) -> Result<(), String> {
            self.sent.push(message.to_string());
            Ok(())
        }
    }

    #[test]
    fn declared_transition_passes_without_follow_ups() {
        let mut store = SqliteStore::open(temp_db("declared")).expect("open store");
        let id = seed(&mut store, TaskState::ReadyForPlan);
        store
            .validate_and_transition(&id, "planning", None, Some("architect"))
            .expect("agent transition");

        let config = fast_config();
        let mut channel = CountingChannel { sent: Vec::new() };
        let report = HandshakeEnforcer::new(&config)
            .enforce(&mut store, &id, TaskState::ReadyForPlan, 0, &mut channel)
            .expect("enforce");

        assert!(report.success);
        assert_eq!(report.final_state, TaskState::Planning);
        assert!(channel.sent.is_empty());
    }

    #[test]
    fn exhausted_retries_drop_the_task_to_needs_fixes() {
        let mut store = SqliteStore::open(temp_db("exhausted")).expect("open store");
        let id = seed(&mut store, TaskState::Planning);

        let config = fast_config();
        let mut channel = CountingChannel { sent: Vec::new() };
        let report = HandshakeEnforcer::new(&config)
            .enforce(&mut store, &id, TaskState::Planning, 0, &mut channel)
            .expect("enforce");

        assert!(!report.success);
        assert_eq!(report.final_state, TaskState::NeedsFixes);
        assert_eq!(report.follow_ups.len(), 2);
        assert_eq!(channel.sent.len(), 2);
        assert_eq!(
            store.get_task(&id).expect("get").state,
            TaskState::NeedsFixes
        );

        // The drop note is on record for the operator.
        let notes = store.list_task_notes(&id).expect("notes");
        assert!(notes.iter().any(|n| n.note.contains("handshake failed")));
    }

    #[test]
    fn drop_from_ready_state_still_lands_in_needs_fixes() {
        // ready_for_plan does not list needs_fixes as a successor; the
        // recovery drop applies anyway so the task never stalls.
        let mut store = SqliteStore::open(temp_db("ready_drop")).expect("open store");
        let id = seed(&mut store, TaskState::ReadyForPlan);

        let config = fast_config();
        let report = HandshakeEnforcer::new(&config)
            .enforce(&mut store, &id, TaskState::ReadyForPlan, 0, &mut NoFollowUp)
            .expect("enforce");

        assert!(!report.success);
        assert_eq!(report.final_state, TaskState::NeedsFixes);
    }

    #[test]
    fn enforcer_is_a_no_op_the_second_time() {
        let mut store = SqliteStore::open(temp_db("idempotent")).expect("open store");
        let id = seed(&mut store, TaskState::ReadyForPlan);
        store
            .validate_and_transition(&id, "planning", None, None)
            .expect("agent transition");

        let config = fast_config();
        let first = HandshakeEnforcer::new(&config)
            .enforce(&mut store, &id, TaskState::ReadyForPlan, 0, &mut NoFollowUp)
            .expect("first enforce");
        let before = store.get_task(&id).expect("get").updated_at_ms;

        let second = HandshakeEnforcer::new(&config)
            .enforce(&mut store, &id, TaskState::ReadyForPlan, 0, &mut NoFollowUp)
            .expect("second enforce");
        let after = store.get_task(&id).expect("get").updated_at_ms;

        assert!(first.success && second.success);
        assert_eq!(first.final_state, second.final_state);
        assert_eq!(before, after, "second enforcement must not write");
    }

    #[test]
    fn without_required_updates_the_state_is_left_alone() {
        let mut store = SqliteStore::open(temp_db("not_required")).expect("open store");
        let id = seed(&mut store, TaskState::Planning);

        let config = CompletionConfig {
            require_explicit_state_update: false,
            ..fast_config()
        };
        let report = HandshakeEnforcer::new(&config)
            .enforce(&mut store, &id, TaskState::Planning, 0, &mut NoFollowUp)
            .expect("enforce");

        assert!(!report.success);
        assert_eq!(report.final_state, TaskState::Planning);
        assert_eq!(store.get_task(&id).expect("get").state, TaskState::Planning);
    }

    #[test]
    fn artifacts_inside_the_window_are_reported() {
        let mut store = SqliteStore::open(temp_db("window")).expect("open store");
        let id = seed(&mut store, TaskState::ReadyForPlan);
        store
            .upsert_artifact(&id, "implementation_plan", "# Plan", None)
            .expect("artifact");
        store
            .validate_and_transition(&id, "planning", None, None)
            .expect("transition");

        let config = fast_config();
        let report = HandshakeEnforcer::new(&config)
            .enforce(&mut store, &id, TaskState::ReadyForPlan, 0, &mut NoFollowUp)
            .expect("enforce");
        assert_eq!(report.artifacts_created.len(), 1);
        assert_eq!(report.artifacts_created[0].name, "implementation_plan");
    }
}
