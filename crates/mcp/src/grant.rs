#![forbid(unsafe_code)]

use cd_core::state::TaskState;
use cd_storage::AgentRow;

/// What one agent session is allowed to do. A grant is a capability record,
/// not a role hierarchy: the surface checks the record, nothing else.
#[derive(Clone, Debug)]
pub struct AgentGrant {
    pub role: String,
    pub allowed_states: Vec<TaskState>,
    pub can_transition_to: Vec<TaskState>,
    pub can_read_plan: bool,
    pub can_execute_commands: bool,
    pub can_update_artifacts: bool,
}

impl AgentGrant {
    /// Unrestricted grant for operator tooling (the stdio binary's default).
    pub fn operator() -> Self {
        Self {
            role: "operator".to_string(),
            allowed_states: cd_core::state::ALL_STATES.to_vec(),
            can_transition_to: cd_core::state::ALL_STATES.to_vec(),
            can_read_plan: true,
            can_execute_commands: true,
            can_update_artifacts: true,
        }
    }

    /// Builds a grant from a persisted agent row. Unknown state names were
    /// rejected at config load, so a row that fails here is corrupt.
    pub fn from_agent_row(row: &AgentRow) -> Result<Self, String> {
        let allowed_states = parse_states(&row.allowed_states)
            .map_err(|s| format!("agent {}: unknown state '{s}' in allowed_states", row.role))?;
        let can_transition_to = parse_states(&row.can_transition_to).map_err(|s| {
            format!("agent {}: unknown state '{s}' in can_transition_to", row.role)
        })?;
        Ok(Self {
            role: row.role.clone(),
            allowed_states,
            can_transition_to,
            can_read_plan: row.can_read_plan,
            can_execute_commands: row.can_execute_commands,
            can_update_artifacts: row.can_update_artifacts,
        })
    }

    pub fn may_handle(&self, state: TaskState) -> bool {
        self.allowed_states.contains(&state)
    }

    pub fn may_transition_to(&self, state: TaskState) -> bool {
        self.can_transition_to.contains(&state)
    }
}

fn parse_states(raw: &[String]) -> Result<Vec<TaskState>, String> {
    let mut states = Vec::with_capacity(raw.len());
    for name in raw {
        match TaskState::parse(name) {
            Some(state) => states.push(state),
            None => return Err(name.clone()),
        }
    }
    Ok(states)
}
