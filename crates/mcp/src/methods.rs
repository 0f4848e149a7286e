#![forbid(unsafe_code)]

use crate::{METHOD_NOT_FOUND, MethodError, MethodSurface};
use cd_core::select::{SelectError, select_next};
use cd_core::state::TaskState;
use cd_storage::{ArtifactRow, RequirementKind, StoreError, TaskFilters, TaskRow};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

impl MethodSurface {
    pub(crate) fn dispatch(&mut self, method: &str, params: &Value) -> Result<Value, MethodError> {
        match method {
            "tasks.get_next" => self.m_tasks_get_next(),
            "tasks.get" => self.m_tasks_get(params),
            "tasks.update_state" => self.m_tasks_update_state(params),
            "tasks.inspect_transition" => self.m_tasks_inspect_transition(params),
            "tasks.append_note" => self.m_tasks_append_note(params),
            "tasks.list" => self.m_tasks_list(params),
            "artifacts.upsert" => self.m_artifacts_upsert(params),
            "artifacts.get" => self.m_artifacts_get(params),
            "artifacts.list" => self.m_artifacts_list(params),
            "requirements.list" => self.m_requirements_list(params),
            "plan.read" => self.m_plan_read(),
            _ => Err(MethodError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {method}"),
                data: None,
            }),
        }
    }

    /// Deadline gate for every mutating method. Checked per call; the store
    /// is never touched once the cycle deadline has passed.
    fn check_mutation_window(&self) -> Result<(), MethodError> {
        if let Some(deadline) = self.deadline_ms
            && now_ms() > deadline
        {
            return Err(MethodError::forbidden(
                "Cycle deadline exceeded; mutations are closed",
                json!({ "kind": "deadline_exceeded" }),
            ));
        }
        Ok(())
    }

    fn m_tasks_get_next(&mut self) -> Result<Value, MethodError> {
        let snapshot = self.store.selection_snapshot().map_err(store_error)?;
        let selection = match select_next(&snapshot, &self.policy, now_ms()) {
            Ok(selection) => selection,
            Err(SelectError::NoTasks) => {
                return Err(MethodError::not_found(
                    "No selectable tasks available",
                    json!({ "kind": "no_selectable_tasks" }),
                ));
            }
            Err(SelectError::AllBlocked(blocked)) => {
                let blocked: Vec<Value> = blocked
                    .iter()
                    .map(|b| json!({ "id": b.id, "title": b.title, "reason": b.reason }))
                    .collect();
                return Err(MethodError::not_found(
                    "All candidate tasks are blocked",
                    json!({ "kind": "no_selectable_tasks", "blocked": blocked }),
                ));
            }
        };

        let task = self.store.get_task(&selection.task_id).map_err(store_error)?;
        let artifacts = self.store.list_artifacts(&task.id).map_err(store_error)?;
        Ok(json!({
            "task": task_json(&task, Some(&artifacts)),
            "selection_reason": selection.reason,
        }))
    }

    fn m_tasks_get(&mut self, params: &Value) -> Result<Value, MethodError> {
        let args = params_object(params)?;
        let task_id = require_string(args, "task_id")?;
        let task = self.store.get_task(&task_id).map_err(store_error)?;
        let artifacts = self.store.list_artifacts(&task.id).map_err(store_error)?;
        Ok(task_json(&task, Some(&artifacts)))
    }

    fn m_tasks_update_state(&mut self, params: &Value) -> Result<Value, MethodError> {
        self.check_mutation_window()?;
        let args = params_object(params)?;
        let task_id = require_string(args, "task_id")?;
        let state = require_string(args, "state")?;
        let note = optional_string(args, "note")?;

        // The grant narrows before the validator rules: a target the role may
        // never enter is forbidden even when the state machine allows it.
        if let Some(target) = TaskState::parse(&state)
            && !self.grant.may_transition_to(target)
        {
            return Err(MethodError::forbidden(
                format!(
                    "Role '{}' may not transition tasks to {target}",
                    self.grant.role
                ),
                json!({ "kind": "forbidden_transition", "role": self.grant.role, "state": target.as_str() }),
            ));
        }

        let outcome = self
            .store
            .validate_and_transition(&task_id, &state, note.as_deref(), Some(&self.grant.role))
            .map_err(store_error)?;
        Ok(json!({
            "success": true,
            "task_id": outcome.task_id,
            "prev_state": outcome.from.as_str(),
            "state": outcome.to.as_str(),
            "updated_at": ts_ms_to_rfc3339(outcome.updated_at_ms),
        }))
    }

    /// Read-only preview of `tasks.update_state`: what would this transition
    /// need. Never mutates, so it carries no grant or deadline checks.
    fn m_tasks_inspect_transition(&mut self, params: &Value) -> Result<Value, MethodError> {
        let args = params_object(params)?;
        let task_id = require_string(args, "task_id")?;
        let state = require_string(args, "state")?;
        let report = self
            .store
            .inspect_transition(&task_id, &state)
            .map_err(store_error)?;
        let allowed: Vec<&str> = report.allowed.iter().map(|s| s.as_str()).collect();
        Ok(json!({
            "is_valid": report.is_valid,
            "reason": report.reason,
            "allowed": allowed,
            "dependencies_blocked": report.dependencies_blocked,
            "missing_handovers": report.missing_handovers,
        }))
    }

    fn m_tasks_append_note(&mut self, params: &Value) -> Result<Value, MethodError> {
        self.check_mutation_window()?;
        let args = params_object(params)?;
        let task_id = require_string(args, "task_id")?;
        let note = require_string(args, "note")?;
        let row = self
            .store
            .append_task_note(&task_id, Some(&self.grant.role), &note)
            .map_err(store_error)?;
        Ok(json!({ "success": true, "task_id": row.task_id, "seq": row.seq }))
    }

    fn m_tasks_list(&mut self, params: &Value) -> Result<Value, MethodError> {
        let args = params_object(params)?;
        let mut filters = TaskFilters::default();
        if let Some(state) = optional_string(args, "state")? {
            let Some(state) = TaskState::parse(&state) else {
                return Err(MethodError::invalid_params(format!(
                    "unknown state filter: {state}"
                )));
            };
            filters.state = Some(state);
        }
        filters.priority = optional_i64(args, "priority")?;
        filters.owner = optional_string(args, "owner")?;

        let tasks = self.store.list_tasks(&filters).map_err(store_error)?;
        let items: Vec<Value> = tasks.iter().map(|t| task_json(t, None)).collect();
        Ok(json!({ "tasks": items, "count": items.len() }))
    }

    fn m_artifacts_upsert(&mut self, params: &Value) -> Result<Value, MethodError> {
        self.check_mutation_window()?;
        if !self.grant.can_update_artifacts {
            return Err(MethodError::forbidden(
                format!("Role '{}' may not write artifacts", self.grant.role),
                json!({ "kind": "forbidden", "capability": "can_update_artifacts" }),
            ));
        }
        let args = params_object(params)?;
        let task_id = require_string(args, "task_id")?;
        let name = require_string(args, "name")?;
        // Content may be empty; the transition gate distinguishes a missing
        // handover from an empty one.
        let content = require_string_allow_empty(args, "content")?;
        let meta_json = match args.get("meta") {
            None | Some(Value::Null) => None,
            Some(meta) => Some(meta.to_string()),
        };

        let artifact = self
            .store
            .upsert_artifact(&task_id, &name, &content, meta_json.as_deref())
            .map_err(store_error)?;
        Ok(json!({
            "success": true,
            "artifact": {
                "id": artifact.id,
                "task_id": artifact.task_id,
                "name": artifact.name,
                "version": artifact.version,
            }
        }))
    }

    fn m_artifacts_get(&mut self, params: &Value) -> Result<Value, MethodError> {
        let args = params_object(params)?;
        let task_id = require_string(args, "task_id")?;
        let name = require_string(args, "name")?;
        let version = optional_i64(args, "version")?;
        let artifact = self
            .store
            .get_artifact(&task_id, &name, version)
            .map_err(store_error)?;
        Ok(artifact_json(&artifact))
    }

    fn m_artifacts_list(&mut self, params: &Value) -> Result<Value, MethodError> {
        let args = params_object(params)?;
        let task_id = require_string(args, "task_id")?;
        // Listing requires the task to exist so typos fail loudly.
        self.store.get_task(&task_id).map_err(store_error)?;
        let artifacts = self.store.list_artifacts(&task_id).map_err(store_error)?;
        let items: Vec<Value> = artifacts.iter().map(artifact_json).collect();
        Ok(json!({ "artifacts": items, "count": items.len() }))
    }

    fn m_requirements_list(&mut self, params: &Value) -> Result<Value, MethodError> {
        let args = params_object(params)?;
        let kind = match optional_string(args, "type")? {
            None => None,
            Some(raw) => match RequirementKind::parse(&raw) {
                Some(kind) => Some(kind),
                None => {
                    return Err(MethodError::invalid_params(format!(
                        "unknown requirement type: {raw}"
                    )));
                }
            },
        };
        let requirements = self.store.list_requirements(kind).map_err(store_error)?;
        let items: Vec<Value> = requirements
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "key": r.key,
                    "title": r.title,
                    "text": r.text,
                    "type": r.kind.as_str(),
                    "created_at": ts_ms_to_rfc3339(r.created_at_ms),
                    "updated_at": ts_ms_to_rfc3339(r.updated_at_ms),
                })
            })
            .collect();
        Ok(json!({ "requirements": items, "count": items.len() }))
    }

    fn m_plan_read(&mut self) -> Result<Value, MethodError> {
        if !self.grant.can_read_plan {
            return Err(MethodError::forbidden(
                format!("Role '{}' may not read the plan", self.grant.role),
                json!({ "kind": "forbidden", "capability": "can_read_plan" }),
            ));
        }
        let Some(plan_file) = self.plan_file.clone() else {
            return Err(MethodError::not_found(
                "Plan file not configured",
                json!({ "kind": "plan_not_configured" }),
            ));
        };
        let content = std::fs::read_to_string(&plan_file).map_err(|e| {
            MethodError::not_found(
                format!("Plan file not readable: {e}"),
                json!({ "kind": "plan_not_found", "path": plan_file.to_string_lossy() }),
            )
        })?;

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let sha256 = format!("{:x}", hasher.finalize());

        let modified_at = std::fs::metadata(&plan_file)
            .ok()
            .and_then(|m| m.modified().ok())
            .map(OffsetDateTime::from)
            .and_then(|dt| dt.format(&Rfc3339).ok());

        Ok(json!({
            "content": content,
            "path": plan_file.to_string_lossy(),
            "size": content.len(),
            "sha256": sha256,
            "modified_at": modified_at,
        }))
    }
}

fn params_object(params: &Value) -> Result<&Map<String, Value>, MethodError> {
    params
        .as_object()
        .ok_or_else(|| MethodError::invalid_params("params must be an object"))
}

fn require_string(args: &Map<String, Value>, key: &str) -> Result<String, MethodError> {
    match args.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(Value::String(_)) => Err(MethodError::invalid_params(format!(
            "parameter '{key}' must not be empty"
        ))),
        Some(_) => Err(MethodError::invalid_params(format!(
            "parameter '{key}' must be a string"
        ))),
        None => Err(MethodError::invalid_params(format!(
            "missing parameter '{key}'"
        ))),
    }
}

fn require_string_allow_empty(
    args: &Map<String, Value>,
    key: &str,
) -> Result<String, MethodError> {
    match args.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(MethodError::invalid_params(format!(
            "parameter '{key}' must be a string"
        ))),
        None => Err(MethodError::invalid_params(format!(
            "missing parameter '{key}'"
        ))),
    }
}

fn optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, MethodError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(MethodError::invalid_params(format!(
            "parameter '{key}' must be a string"
        ))),
    }
}

fn optional_i64(args: &Map<String, Value>, key: &str) -> Result<Option<i64>, MethodError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or_else(|| {
            MethodError::invalid_params(format!("parameter '{key}' must be an integer"))
        }),
    }
}

fn task_json(task: &TaskRow, artifacts: Option<&[ArtifactRow]>) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("id".to_string(), json!(task.id));
    obj.insert("title".to_string(), json!(task.title));
    obj.insert("description".to_string(), json!(task.description));
    obj.insert("state".to_string(), json!(task.state.as_str()));
    obj.insert("priority".to_string(), json!(task.priority));
    obj.insert("owner".to_string(), json!(task.owner));
    obj.insert("tags".to_string(), json!(task.tags));
    obj.insert("dependencies".to_string(), json!(task.dependencies));
    obj.insert(
        "created_at".to_string(),
        json!(ts_ms_to_rfc3339(task.created_at_ms)),
    );
    obj.insert(
        "updated_at".to_string(),
        json!(ts_ms_to_rfc3339(task.updated_at_ms)),
    );
    if let Some(artifacts) = artifacts {
        let items: Vec<Value> = artifacts.iter().map(artifact_summary_json).collect();
        obj.insert("artifacts".to_string(), Value::Array(items));
    }
    Value::Object(obj)
}

fn artifact_json(artifact: &ArtifactRow) -> Value {
    json!({
        "id": artifact.id,
        "task_id": artifact.task_id,
        "name": artifact.name,
        "version": artifact.version,
        "content": artifact.content,
        "meta": artifact
            .meta_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok()),
        "created_at": ts_ms_to_rfc3339(artifact.created_at_ms),
    })
}

/// Embedded artifact lists skip `content`; agents fetch bodies explicitly to
/// keep `tasks.get` responses small.
fn artifact_summary_json(artifact: &ArtifactRow) -> Value {
    json!({
        "name": artifact.name,
        "version": artifact.version,
        "created_at": ts_ms_to_rfc3339(artifact.created_at_ms),
    })
}

fn store_error(err: StoreError) -> MethodError {
    let message = err.to_string();
    match err {
        StoreError::UnknownTask(task_id) => MethodError::not_found(
            message,
            json!({ "kind": "task_not_found", "task_id": task_id }),
        ),
        StoreError::UnknownRequirement(key) => MethodError::not_found(
            message,
            json!({ "kind": "requirement_not_found", "key": key }),
        ),
        StoreError::UnknownArtifact {
            task_id,
            name,
            version,
        } => MethodError::not_found(
            message,
            json!({ "kind": "artifact_not_found", "task_id": task_id, "name": name, "version": version }),
        ),
        StoreError::IllegalTransition {
            from,
            requested,
            allowed,
        } => {
            let allowed: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
            MethodError::invalid_params_with(
                message,
                json!({ "kind": "illegal_transition", "from": from.as_str(), "requested": requested, "allowed": allowed }),
            )
        }
        StoreError::DependencyIncomplete {
            task_id,
            dep_id,
            dep_title,
            dep_state,
        } => MethodError::invalid_params_with(
            message,
            json!({
                "kind": "dependency_incomplete",
                "task_id": task_id,
                "dependency": dep_id,
                "dependency_title": dep_title,
                "dependency_state": dep_state.map(|s| s.as_str()),
            }),
        ),
        StoreError::MissingHandover { name, from, to } => MethodError::invalid_params_with(
            message,
            json!({ "kind": "missing_handover", "artifact": name, "from": from.as_str(), "to": to.as_str() }),
        ),
        StoreError::EmptyHandover { name, from, to } => MethodError::invalid_params_with(
            message,
            json!({ "kind": "empty_handover", "artifact": name, "from": from.as_str(), "to": to.as_str() }),
        ),
        StoreError::TaskBusy { task_id, holder } => MethodError::forbidden(
            message,
            json!({ "kind": "task_busy", "task_id": task_id, "holder": holder }),
        ),
        StoreError::InvalidInput(_) => MethodError::invalid_params(message),
        StoreError::Io(_) | StoreError::Sql(_) => MethodError::internal(message),
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(i64::MAX as u128) as i64
}

pub(crate) fn ts_ms_to_rfc3339(ts_ms: i64) -> String {
    let nanos = (ts_ms as i128) * 1_000_000i128;
    let dt = OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    dt.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
