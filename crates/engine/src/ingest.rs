#![forbid(unsafe_code)]

//! Plan payload ingestion. Plan *parsing* lives outside the core; this module
//! consumes the parser's output — requirement records plus task seeds — and
//! writes them into the store.

use cd_core::state::TaskState;
use cd_storage::{NewTask, RequirementKind, SqliteStore, StoreError};
use serde::Deserialize;

#[derive(Debug)]
pub enum IngestError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Store(StoreError),
    Invalid(String),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "ingest io: {err}"),
            Self::Json(err) => write!(f, "ingest parse: {err}"),
            Self::Store(err) => write!(f, "ingest store: {err}"),
            Self::Invalid(message) => write!(f, "ingest invalid: {message}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<std::io::Error> for IngestError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<StoreError> for IngestError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// The externally-parsed plan payload. Tasks may depend on tasks defined
/// earlier in the same payload or already present in the store.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanPayload {
    #[serde(default)]
    pub requirements: Vec<RequirementSeed>,
    #[serde(default)]
    pub tasks: Vec<TaskSeed>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequirementSeed {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSeed {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Requirement keys to link.
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IngestSummary {
    pub requirements: usize,
    pub tasks_created: usize,
    pub tasks_skipped: usize,
    pub links: usize,
}

pub fn ingest_payload(
    store: &mut SqliteStore,
    payload: &PlanPayload,
) -> Result<IngestSummary, IngestError> {
    let mut summary = IngestSummary::default();

    for seed in &payload.requirements {
        let Some(kind) = RequirementKind::parse(&seed.kind) else {
            return Err(IngestError::Invalid(format!(
                "requirement {}: unknown type '{}'",
                seed.key, seed.kind
            )));
        };
        store.upsert_requirement(&seed.key, &seed.title, &seed.text, kind)?;
        summary.requirements += 1;
    }

    for seed in &payload.tasks {
        let state = match &seed.state {
            None => None,
            Some(raw) => match TaskState::parse(raw) {
                Some(state) => Some(state),
                None => {
                    return Err(IngestError::Invalid(format!(
                        "task '{}': unknown state '{raw}'",
                        seed.title
                    )));
                }
            },
        };

        // Re-ingesting a payload must not clobber live task state: a task
        // whose id already exists is skipped, links included.
        if let Some(id) = &seed.id
            && store.get_task(id).is_ok()
        {
            summary.tasks_skipped += 1;
            continue;
        }

        let task = store.create_task(NewTask {
            id: seed.id.clone(),
            title: seed.title.clone(),
            description: seed.description.clone(),
            state,
            priority: seed.priority,
            owner: seed.owner.clone(),
            tags: seed.tags.clone(),
            dependencies: seed.dependencies.clone(),
        })?;
        summary.tasks_created += 1;

        for key in &seed.requirements {
            store.link_task_requirement(&task.id, key)?;
            summary.links += 1;
        }
    }

    Ok(summary)
}

pub fn ingest_file(
    store: &mut SqliteStore,
    path: &std::path::Path,
) -> Result<IngestSummary, IngestError> {
    let raw = std::fs::read_to_string(path)?;
    let payload: PlanPayload = serde_json::from_str(&raw)?;
    ingest_payload(store, &payload)
}
