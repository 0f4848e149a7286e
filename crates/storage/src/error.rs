#![forbid(unsafe_code)]

use cd_core::state::TaskState;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    UnknownTask(String),
    UnknownRequirement(String),
    UnknownArtifact {
        task_id: String,
        name: String,
        version: i64,
    },
    /// The requested target is not a legal successor (or not a state at all).
    /// Carries the legal set so callers can surface it to the agent verbatim.
    IllegalTransition {
        from: TaskState,
        requested: String,
        allowed: Vec<TaskState>,
    },
    /// Entry into a work state with an unfinished or unresolvable dependency.
    /// `dep_state` is `None` when the dependency id does not resolve.
    DependencyIncomplete {
        task_id: String,
        dep_id: String,
        dep_title: String,
        dep_state: Option<TaskState>,
    },
    MissingHandover {
        name: &'static str,
        from: TaskState,
        to: TaskState,
    },
    EmptyHandover {
        name: &'static str,
        from: TaskState,
        to: TaskState,
    },
    /// Another cycle holds the advisory lock for this task.
    TaskBusy {
        task_id: String,
        holder: String,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::UnknownTask(id) => write!(f, "task not found: {id}"),
            Self::UnknownRequirement(key) => write!(f, "requirement not found: {key}"),
            Self::UnknownArtifact {
                task_id,
                name,
                version,
            } => {
                if *version == 0 {
                    write!(f, "artifact not found: {task_id}/{name}")
                } else {
                    write!(f, "artifact not found: {task_id}/{name} v{version}")
                }
            }
            Self::IllegalTransition {
                from,
                requested,
                allowed,
            } => {
                let allowed = allowed
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(
                    f,
                    "illegal transition from {from} to {requested} (allowed: [{allowed}])"
                )
            }
            Self::DependencyIncomplete {
                task_id,
                dep_id,
                dep_title,
                dep_state,
            } => match dep_state {
                Some(state) => write!(
                    f,
                    "task {task_id}: dependency {dep_id} ({dep_title}) is not complete (state: {state})"
                ),
                None => write!(f, "task {task_id}: dependency {dep_id} not found"),
            },
            Self::MissingHandover { name, from, to } => write!(
                f,
                "required handover artifact '{name}' not found for transition {from} -> {to}"
            ),
            Self::EmptyHandover { name, from, to } => write!(
                f,
                "required handover artifact '{name}' exists but is empty ({from} -> {to})"
            ),
            Self::TaskBusy { task_id, holder } => {
                write!(f, "task {task_id} is busy (locked by cycle {holder})")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}
