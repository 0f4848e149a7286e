#![forbid(unsafe_code)]

use cd_core::state::TaskState;

#[derive(Clone, Debug)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub state: TaskState,
    pub priority: i64,
    pub owner: Option<String>,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Input for task creation. Tasks are created externally (ingest, operator
/// CLI); the cycle core only ever mutates them through the validator.
#[derive(Clone, Debug, Default)]
pub struct NewTask {
    /// Explicit id; a `TASK-%03d` counter id is allocated when absent.
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    /// Defaults to `ready_for_plan`.
    pub state: Option<TaskState>,
    /// Defaults to 5.
    pub priority: Option<i64>,
    pub owner: Option<String>,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct TaskFilters {
    pub state: Option<TaskState>,
    pub priority: Option<i64>,
    pub owner: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequirementKind {
    Functional,
    NonFunctional,
    Constraint,
    Risk,
    Acceptance,
}

impl RequirementKind {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "functional" => Some(Self::Functional),
            "non_functional" | "nonfunctional" => Some(Self::NonFunctional),
            "constraint" => Some(Self::Constraint),
            "risk" => Some(Self::Risk),
            "acceptance" => Some(Self::Acceptance),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::NonFunctional => "non_functional",
            Self::Constraint => "constraint",
            Self::Risk => "risk",
            Self::Acceptance => "acceptance",
        }
    }
}

impl std::fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct RequirementRow {
    pub id: String,
    pub key: String,
    pub title: String,
    pub text: String,
    pub kind: RequirementKind,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ArtifactRow {
    pub id: String,
    pub task_id: String,
    pub name: String,
    pub version: i64,
    pub content: String,
    pub meta_json: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct TaskNoteRow {
    pub seq: i64,
    pub task_id: String,
    pub ts_ms: i64,
    pub actor: Option<String>,
    pub note: String,
}

#[derive(Clone, Debug)]
pub struct AgentRow {
    pub role: String,
    pub description: Option<String>,
    pub allowed_states: Vec<String>,
    pub can_transition_to: Vec<String>,
    pub can_read_plan: bool,
    pub can_execute_commands: bool,
    pub can_update_artifacts: bool,
    pub prompt_template: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    Error,
    Blocked,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct NewAuditEntry {
    pub cycle_id: String,
    pub task_id: String,
    pub prev_state: Option<TaskState>,
    pub next_state: Option<TaskState>,
    pub actor: Option<String>,
    pub selection_reason: Option<String>,
    pub inputs_summary: Option<String>,
    pub outputs_summary: Option<String>,
    pub commands_json: String,
    pub result: CycleOutcome,
    pub note: Option<String>,
    pub follow_ups_json: String,
}

#[derive(Clone, Debug)]
pub struct AuditRow {
    pub id: String,
    pub cycle_id: String,
    pub task_id: String,
    pub prev_state: Option<String>,
    pub next_state: Option<String>,
    pub actor: Option<String>,
    pub selection_reason: Option<String>,
    pub inputs_summary: Option<String>,
    pub outputs_summary: Option<String>,
    pub commands_json: String,
    pub result: String,
    pub note: Option<String>,
    pub follow_ups_json: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub task_id: String,
    pub from: TaskState,
    pub to: TaskState,
    pub updated_at_ms: i64,
}

/// Read-only answer to "what would this transition need".
#[derive(Clone, Debug)]
pub struct TransitionReport {
    pub is_valid: bool,
    pub reason: Option<String>,
    pub allowed: Vec<TaskState>,
    pub dependencies_blocked: Vec<String>,
    pub missing_handovers: Vec<&'static str>,
}

/// Aggregate counts for the status/report surfaces.
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub total_tasks: i64,
    pub by_state: Vec<(String, i64)>,
    pub completed: i64,
    pub completion_rate: f64,
}
