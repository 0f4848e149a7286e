#![forbid(unsafe_code)]

//! Dependency-aware task selection.
//!
//! Selection is a pure function over a snapshot of task facts: same snapshot,
//! same policy, same result. The store produces the snapshot; nothing here
//! touches storage or the clock beyond the `now_ms` the caller passes in for
//! age formatting.

use crate::state::TaskState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionAlgorithm {
    PriorityDependency,
}

impl SelectionAlgorithm {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "priority_dependency" => Some(Self::PriorityDependency),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriorityDependency => "priority_dependency",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieBreaker {
    OldestUpdated,
    NewestCreated,
    Alphabetical,
}

impl TieBreaker {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "oldest_updated" => Some(Self::OldestUpdated),
            "newest_created" => Some(Self::NewestCreated),
            "alphabetical" => Some(Self::Alphabetical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OldestUpdated => "oldest_updated",
            Self::NewestCreated => "newest_created",
            Self::Alphabetical => "alphabetical",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SelectionPolicy {
    pub algorithm: SelectionAlgorithm,
    pub dependency_strict: bool,
    pub prefer_leaf_tasks: bool,
    pub tie_breaker: TieBreaker,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            algorithm: SelectionAlgorithm::PriorityDependency,
            dependency_strict: true,
            prefer_leaf_tasks: true,
            tie_breaker: TieBreaker::OldestUpdated,
        }
    }
}

/// One task as the selector sees it. The snapshot must contain every task in
/// the store, terminal ones included, so dependencies resolve.
#[derive(Clone, Debug)]
pub struct TaskFacts {
    pub id: String,
    pub title: String,
    pub state: TaskState,
    pub priority: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub dependencies: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockedTask {
    pub id: String,
    pub title: String,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub task_id: String,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub enum SelectError {
    /// The store holds no non-terminal tasks.
    NoTasks,
    /// Every candidate is blocked; carries the per-task reasons.
    AllBlocked(Vec<BlockedTask>),
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTasks => write!(f, "no selectable tasks available"),
            Self::AllBlocked(blocked) => {
                write!(f, "all {} candidate tasks are blocked", blocked.len())?;
                for task in blocked {
                    write!(f, "; {} ({}): {}", task.id, task.title, task.reason)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for SelectError {}

struct Candidate<'a> {
    facts: &'a TaskFacts,
    is_leaf: bool,
}

pub fn select_next(
    tasks: &[TaskFacts],
    policy: &SelectionPolicy,
    now_ms: i64,
) -> Result<Selection, SelectError> {
    match policy.algorithm {
        SelectionAlgorithm::PriorityDependency => {
            select_priority_dependency(tasks, policy, now_ms)
        }
    }
}

/// Classifies a task as blocked, returning the reason.
///
/// An unresolvable dependency id blocks unconditionally; an unfinished
/// dependency blocks only under `dependency_strict`.
pub fn blocked_reason(task: &TaskFacts, tasks: &[TaskFacts], strict: bool) -> Option<String> {
    for dep_id in &task.dependencies {
        let Some(dep) = tasks.iter().find(|t| &t.id == dep_id) else {
            return Some(format!("dependency {dep_id} not found"));
        };
        if strict && dep.state != TaskState::Done {
            return Some(format!(
                "dependency {} ({}) not complete (state: {})",
                dep.id, dep.title, dep.state
            ));
        }
    }
    None
}

fn is_leaf(task: &TaskFacts, tasks: &[TaskFacts]) -> bool {
    !tasks.iter().any(|other| {
        other.id != task.id
            && other.state != TaskState::Done
            && other.dependencies.iter().any(|dep| dep == &task.id)
    })
}

fn select_priority_dependency(
    tasks: &[TaskFacts],
    policy: &SelectionPolicy,
    now_ms: i64,
) -> Result<Selection, SelectError> {
    let open: Vec<&TaskFacts> = tasks.iter().filter(|t| !t.state.is_terminal()).collect();
    if open.is_empty() {
        return Err(SelectError::NoTasks);
    }

    let mut blocked = Vec::new();
    let mut available = Vec::new();
    for task in &open {
        match blocked_reason(task, tasks, policy.dependency_strict) {
            Some(reason) => blocked.push(BlockedTask {
                id: task.id.clone(),
                title: task.title.clone(),
                reason,
            }),
            None => available.push(Candidate {
                facts: task,
                is_leaf: is_leaf(task, tasks),
            }),
        }
    }

    if available.is_empty() {
        return Err(SelectError::AllBlocked(blocked));
    }

    available.sort_by(|a, b| {
        b.facts
            .priority
            .cmp(&a.facts.priority)
            .then_with(|| {
                if policy.prefer_leaf_tasks {
                    b.is_leaf.cmp(&a.is_leaf)
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .then_with(|| match policy.tie_breaker {
                TieBreaker::OldestUpdated => a.facts.updated_at_ms.cmp(&b.facts.updated_at_ms),
                TieBreaker::NewestCreated => b.facts.created_at_ms.cmp(&a.facts.created_at_ms),
                TieBreaker::Alphabetical => a.facts.title.cmp(&b.facts.title),
            })
            // Documented final fallback: title, then id, so identical
            // priorities and timestamps still order deterministically.
            .then_with(|| a.facts.title.cmp(&b.facts.title))
            .then_with(|| a.facts.id.cmp(&b.facts.id))
    });

    let selected = &available[0];
    let reason = build_reason(selected, policy, open.len(), available.len(), now_ms);
    Ok(Selection {
        task_id: selected.facts.id.clone(),
        reason,
    })
}

fn build_reason(
    selected: &Candidate<'_>,
    policy: &SelectionPolicy,
    total: usize,
    available: usize,
    now_ms: i64,
) -> String {
    let mut criteria = Vec::new();

    let priority = selected.facts.priority;
    if priority > 5 {
        criteria.push(format!("high priority ({priority})"));
    } else if priority == 5 {
        criteria.push(format!("normal priority ({priority})"));
    } else {
        criteria.push(format!("low priority ({priority})"));
    }

    if policy.prefer_leaf_tasks && selected.is_leaf {
        criteria.push("leaf task (no dependents)".to_string());
    }

    let deps = selected.facts.dependencies.len();
    if deps > 0 {
        criteria.push(format!("{deps} dependencies satisfied"));
    } else {
        criteria.push("no dependencies".to_string());
    }

    if policy.tie_breaker == TieBreaker::OldestUpdated {
        let age_ms = now_ms.saturating_sub(selected.facts.updated_at_ms).max(0);
        let hours = age_ms / 3_600_000;
        if hours >= 24 {
            criteria.push(format!("oldest update ({}d ago)", hours / 24));
        } else {
            criteria.push(format!("oldest update ({hours}h ago)"));
        }
    }

    format!(
        "selected from {total} candidates ({available} available): {}",
        criteria.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, title: &str, state: TaskState, priority: i64) -> TaskFacts {
        TaskFacts {
            id: id.to_string(),
            title: title.to_string(),
            state,
            priority,
            created_at_ms: 1_000,
            updated_at_ms: 1_000,
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn empty_store_yields_no_tasks() {
        let err = select_next(&[], &SelectionPolicy::default(), 0).unwrap_err();
        assert!(matches!(err, SelectError::NoTasks));
    }

    #[test]
    fn done_tasks_are_not_candidates() {
        let tasks = vec![task("T1", "Only", TaskState::Done, 9)];
        let err = select_next(&tasks, &SelectionPolicy::default(), 0).unwrap_err();
        assert!(matches!(err, SelectError::NoTasks));
    }

    #[test]
    fn higher_priority_wins() {
        let tasks = vec![
            task("T1", "Low", TaskState::ReadyForPlan, 3),
            task("T2", "High", TaskState::ReadyForPlan, 8),
        ];
        let selection = select_next(&tasks, &SelectionPolicy::default(), 2_000).unwrap();
        assert_eq!(selection.task_id, "T2");
        assert!(selection.reason.contains("high priority (8)"));
    }

    #[test]
    fn unfinished_dependency_blocks_under_strict_policy() {
        let mut blocked_task = task("T1", "Blocked", TaskState::ReadyForPlan, 9);
        blocked_task.dependencies = vec!["T2".to_string()];
        let tasks = vec![blocked_task, task("T2", "Dep", TaskState::Planning, 5)];

        // T1 outranks T2 but its dependency is still in flight.
        let selection = select_next(&tasks, &SelectionPolicy::default(), 2_000).unwrap();
        assert_eq!(selection.task_id, "T2");
    }

    #[test]
    fn all_blocked_carries_per_task_reasons() {
        let mut t1 = task("T1", "Blocked", TaskState::ReadyForPlan, 9);
        t1.dependencies = vec!["T2".to_string()];
        let err = select_next(&[t1], &SelectionPolicy::default(), 2_000).unwrap_err();
        match err {
            SelectError::AllBlocked(blocked) => {
                assert_eq!(blocked.len(), 1);
                assert!(blocked[0].reason.contains("dependency T2 not found"));
            }
            other => panic!("expected AllBlocked, got {other:?}"),
        }
    }

    #[test]
    fn unresolvable_dependency_blocks_even_when_not_strict() {
        let mut t = task("T1", "Dangling", TaskState::ReadyForPlan, 5);
        t.dependencies = vec!["ghost".to_string()];
        let tasks = vec![t];
        let policy = SelectionPolicy {
            dependency_strict: false,
            ..SelectionPolicy::default()
        };
        let err = select_next(&tasks, &policy, 0).unwrap_err();
        match err {
            SelectError::AllBlocked(blocked) => {
                assert!(blocked[0].reason.contains("dependency ghost not found"));
            }
            other => panic!("expected AllBlocked, got {other:?}"),
        }
    }

    #[test]
    fn done_dependency_satisfies_strict_policy() {
        let mut t = task("T1", "Ready", TaskState::ReadyForPlan, 5);
        t.dependencies = vec!["T2".to_string()];
        let tasks = vec![t, task("T2", "Dep", TaskState::Done, 5)];
        let selection = select_next(&tasks, &SelectionPolicy::default(), 2_000).unwrap();
        assert_eq!(selection.task_id, "T1");
        assert!(selection.reason.contains("1 dependencies satisfied"));
    }

    #[test]
    fn leaf_tasks_win_ties_when_preferred() {
        // T1 is depended on by open task T3, so T1 is not a leaf.
        let t1 = task("T1", "Inner", TaskState::ReadyForPlan, 5);
        let t2 = task("T2", "Leaf", TaskState::ReadyForPlan, 5);
        let mut t3 = task("T3", "Dependent", TaskState::ReadyForPlan, 1);
        t3.dependencies = vec!["T1".to_string()];

        let tasks = vec![t1, t2, t3];
        let selection = select_next(&tasks, &SelectionPolicy::default(), 2_000).unwrap();
        assert_eq!(selection.task_id, "T2");
        assert!(selection.reason.contains("leaf task"));
    }

    #[test]
    fn oldest_updated_breaks_priority_ties() {
        let mut a = task("A", "Alpha", TaskState::ReadyForPlan, 5);
        a.updated_at_ms = 1_000;
        let mut b = task("B", "Beta", TaskState::ReadyForPlan, 5);
        b.updated_at_ms = 5_000;
        let tasks = vec![b, a];
        let selection =
            select_next(&tasks, &SelectionPolicy::default(), 90_000_000).unwrap();
        assert_eq!(selection.task_id, "A");
        assert!(selection.reason.contains("oldest update"));
    }

    #[test]
    fn alphabetical_is_the_final_fallback() {
        // Equal priority, both leaves, equal timestamps: title decides.
        let policy = SelectionPolicy {
            tie_breaker: TieBreaker::OldestUpdated,
            ..SelectionPolicy::default()
        };
        let a = task("T9", "Apple", TaskState::ReadyForPlan, 5);
        let b = task("T1", "Banana", TaskState::ReadyForPlan, 5);
        let selection = select_next(&[b, a], &policy, 2_000).unwrap();
        assert_eq!(selection.task_id, "T9");
    }

    #[test]
    fn selection_is_deterministic_for_a_fixed_snapshot() {
        let tasks = vec![
            task("T1", "One", TaskState::ReadyForPlan, 5),
            task("T2", "Two", TaskState::NeedsFixes, 5),
            task("T3", "Three", TaskState::ReadyForPlan, 7),
        ];
        let policy = SelectionPolicy::default();
        let first = select_next(&tasks, &policy, 10_000).unwrap();
        for _ in 0..10 {
            let again = select_next(&tasks, &policy, 10_000).unwrap();
            assert_eq!(again.task_id, first.task_id);
            assert_eq!(again.reason, first.reason);
        }
    }
}
