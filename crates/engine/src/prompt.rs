#![forbid(unsafe_code)]

//! Role prompt synthesis. Everything in the prompt comes from the cycle's
//! rehydrated context — no state from previous cycles can leak in because
//! none is reachable from here.

use crate::config::AgentConfig;
use crate::cycle::CycleContext;
use cd_core::state::required_handover;
use std::fmt::Write;

pub fn build_prompt(ctx: &CycleContext, role_name: &str, agent: &AgentConfig) -> String {
    let task = &ctx.task;
    let mut out = String::new();

    let _ = writeln!(out, "# {role_name} role");
    out.push('\n');
    if !agent.description.is_empty() {
        let _ = writeln!(out, "{}", agent.description);
        out.push('\n');
    }

    let _ = writeln!(out, "## Current task");
    let _ = writeln!(out, "- id: {}", task.id);
    let _ = writeln!(out, "- title: {}", task.title);
    if let Some(description) = &task.description {
        let _ = writeln!(out, "- description: {description}");
    }
    let _ = writeln!(out, "- state: {}", task.state);
    let _ = writeln!(out, "- priority: {}", task.priority);
    out.push('\n');

    if !ctx.requirements.is_empty() {
        let _ = writeln!(out, "## Linked requirements");
        for requirement in &ctx.requirements {
            let _ = writeln!(
                out,
                "- {} ({}): {}",
                requirement.key, requirement.kind, requirement.title
            );
        }
        out.push('\n');
    }

    if !ctx.latest_artifacts.is_empty() {
        let _ = writeln!(out, "## Existing artifacts (latest versions)");
        for artifact in &ctx.latest_artifacts {
            let _ = writeln!(out, "- {} (v{})", artifact.name, artifact.version);
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Legal next states");
    for next in task.state.successors() {
        match required_handover(task.state, *next) {
            Some(handover) => {
                let _ = writeln!(out, "- {next} (requires nonempty artifact '{handover}')");
            }
            None => {
                let _ = writeln!(out, "- {next}");
            }
        }
    }
    out.push('\n');

    let _ = writeln!(out, "## Rules");
    let _ = writeln!(
        out,
        "- Work only on this task, in its current state ({})",
        task.state
    );
    let _ = writeln!(
        out,
        "- Create required handover artifacts via artifacts.upsert before transitioning"
    );
    let _ = writeln!(
        out,
        "- Declare the outcome explicitly via tasks.update_state; a cycle without a \
         declared transition is treated as a failure"
    );
    let _ = writeln!(
        out,
        "- The method surface speaks line-delimited JSON-RPC at the address in \
         CADENCE_SURFACE_ADDR; call initialize first"
    );
    out.push('\n');

    let _ = writeln!(out, "## Available methods");
    for method in cd_mcp::METHOD_NAMES {
        let _ = writeln!(out, "- {method}");
    }

    if let Some(plan) = &ctx.plan
        && agent.capabilities.can_read_plan
    {
        out.push('\n');
        let _ = writeln!(
            out,
            "The project plan is available via plan.read (sha256 {}).",
            plan.sha256
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentCapabilities;
    use cd_core::state::TaskState;
    use cd_storage::TaskRow;

    fn context(state: TaskState) -> CycleContext {
        CycleContext {
            cycle_id: "CYC-000001".to_string(),
            started_at_ms: 0,
            deadline_ms: None,
            selection_reason: "selected from 1 candidates (1 available)".to_string(),
            task: TaskRow {
                id: "T1".to_string(),
                title: "Auth".to_string(),
                description: Some("Add login".to_string()),
                state,
                priority: 7,
                owner: None,
                tags: Vec::new(),
                dependencies: Vec::new(),
                created_at_ms: 0,
                updated_at_ms: 0,
            },
            latest_artifacts: Vec::new(),
            requirements: Vec::new(),
            plan: None,
        }
    }

    fn agent() -> AgentConfig {
        AgentConfig {
            description: "Plans work".to_string(),
            allowed_states: vec!["planning".to_string()],
            can_transition_to: vec!["ready_for_implementation".to_string()],
            capabilities: AgentCapabilities {
                can_read_plan: false,
                can_execute_commands: false,
                can_update_artifacts: true,
            },
            prompt_template: None,
        }
    }

    #[test]
    fn prompt_names_task_state_and_methods() {
        let prompt = build_prompt(&context(TaskState::Planning), "architect", &agent());
        assert!(prompt.contains("# architect role"));
        assert!(prompt.contains("- id: T1"));
        assert!(prompt.contains("- state: planning"));
        assert!(prompt.contains("tasks.update_state"));
        assert!(prompt.contains("artifacts.upsert"));
    }

    #[test]
    fn prompt_spells_out_handover_obligations() {
        let prompt = build_prompt(&context(TaskState::Planning), "architect", &agent());
        assert!(
            prompt.contains("ready_for_implementation (requires nonempty artifact 'implementation_plan')"),
            "prompt: {prompt}"
        );
    }
}
