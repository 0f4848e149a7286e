#![forbid(unsafe_code)]

//! Task lifecycle state machine.
//!
//! The transition table and the required-handover table are the single
//! authoritative definition; the validator, the method surface and the cycle
//! engine all consult this module rather than carrying their own copies.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    ReadyForPlan,
    Planning,
    ReadyForImplementation,
    Implementing,
    ReadyForCodeReview,
    Reviewing,
    ReadyForCommit,
    Committing,
    NeedsFixes,
    Fixing,
    Done,
}

pub const ALL_STATES: [TaskState; 11] = [
    TaskState::ReadyForPlan,
    TaskState::Planning,
    TaskState::ReadyForImplementation,
    TaskState::Implementing,
    TaskState::ReadyForCodeReview,
    TaskState::Reviewing,
    TaskState::ReadyForCommit,
    TaskState::Committing,
    TaskState::NeedsFixes,
    TaskState::Fixing,
    TaskState::Done,
];

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadyForPlan => "ready_for_plan",
            Self::Planning => "planning",
            Self::ReadyForImplementation => "ready_for_implementation",
            Self::Implementing => "implementing",
            Self::ReadyForCodeReview => "ready_for_code_review",
            Self::Reviewing => "reviewing",
            Self::ReadyForCommit => "ready_for_commit",
            Self::Committing => "committing",
            Self::NeedsFixes => "needs_fixes",
            Self::Fixing => "fixing",
            Self::Done => "DONE",
        }
    }

    /// Parses a canonical state name or a known alias.
    ///
    /// Aliases cover misspellings agents produce often enough that rejecting
    /// them only burns a follow-up round trip.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        for state in ALL_STATES {
            if state.as_str() == trimmed {
                return Some(state);
            }
        }
        match trimmed {
            "done" => Some(Self::Done),
            "ready_for_implmentation" => Some(Self::ReadyForImplementation),
            "ready_for_code_revie" => Some(Self::ReadyForCodeReview),
            "need_fixes" => Some(Self::NeedsFixes),
            "commiting" => Some(Self::Committing),
            _ => None,
        }
    }

    pub fn successors(self) -> &'static [TaskState] {
        match self {
            Self::ReadyForPlan => &[Self::Planning],
            Self::Planning => &[Self::ReadyForImplementation, Self::NeedsFixes],
            Self::ReadyForImplementation => &[Self::Implementing],
            Self::Implementing => &[Self::ReadyForCodeReview, Self::NeedsFixes],
            Self::ReadyForCodeReview => &[Self::Reviewing],
            Self::Reviewing => &[Self::ReadyForCommit, Self::NeedsFixes],
            Self::ReadyForCommit => &[Self::Committing],
            Self::Committing => &[Self::Done, Self::NeedsFixes],
            Self::NeedsFixes => &[Self::Fixing],
            Self::Fixing => &[Self::ReadyForCodeReview, Self::NeedsFixes],
            Self::Done => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// Work states require every dependency to be DONE before entry.
    pub fn is_work_state(self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Implementing | Self::Reviewing | Self::Committing
        )
    }

    pub fn allows(self, next: TaskState) -> bool {
        self.successors().contains(&next)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The handover artifact a transition must present, if any.
///
/// The validator rejects the transition when the named artifact is missing or
/// empty at its latest version.
pub fn required_handover(from: TaskState, to: TaskState) -> Option<&'static str> {
    match (from, to) {
        (TaskState::Planning, TaskState::ReadyForImplementation) => Some("implementation_plan"),
        (TaskState::Implementing, TaskState::ReadyForCodeReview) => Some("change_summary"),
        (TaskState::Reviewing, TaskState::ReadyForCommit) => Some("review_findings"),
        (TaskState::Reviewing, TaskState::NeedsFixes) => Some("review_findings"),
        (TaskState::Fixing, TaskState::ReadyForCodeReview) => Some("fix_plan"),
        (TaskState::Committing, TaskState::Done) => Some("commit_summary"),
        _ => None,
    }
}
