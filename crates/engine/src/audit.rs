#![forbid(unsafe_code)]

//! Audit entry assembly: serializes cycle provenance into the JSON columns
//! the store persists. Recording itself is `SqliteStore::append_audit`.

use crate::config::SecurityConfig;
use crate::cycle::CycleContext;
use crate::handshake::FollowUpRecord;
use crate::redact::redact;
use cd_storage::ArtifactRow;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// References to everything the cycle rehydrated: plan digest, requirement
/// keys, artifact names and versions.
pub fn inputs_summary(ctx: &CycleContext) -> String {
    let requirements: Vec<&str> = ctx.requirements.iter().map(|r| r.key.as_str()).collect();
    let artifacts: Vec<Value> = ctx
        .latest_artifacts
        .iter()
        .map(|a| json!({ "name": a.name, "version": a.version }))
        .collect();
    let plan = ctx.plan.as_ref().map(|p| {
        json!({
            "path": p.path.to_string_lossy(),
            "sha256": p.sha256,
            "size": p.size,
        })
    });
    json!({
        "task": ctx.task.id,
        "state": ctx.task.state.as_str(),
        "priority": ctx.task.priority,
        "plan": plan,
        "requirements": requirements,
        "artifacts": artifacts,
    })
    .to_string()
}

/// Artifacts the cycle produced, with content digests for reproducibility.
pub fn outputs_summary(artifacts: &[ArtifactRow]) -> String {
    let items: Vec<Value> = artifacts
        .iter()
        .map(|a| {
            let mut hasher = Sha256::new();
            hasher.update(a.content.as_bytes());
            json!({
                "name": a.name,
                "version": a.version,
                "sha256": format!("{:x}", hasher.finalize()),
            })
        })
        .collect();
    Value::Array(items).to_string()
}

/// Observed commands, each tagged against the allowlist. The engine never
/// executes these; it records what the runner reported.
pub fn commands_json(commands: &[String], security: &SecurityConfig) -> String {
    let items: Vec<Value> = commands
        .iter()
        .map(|command| {
            let recorded = if security.redact_in_logs {
                redact(command)
            } else {
                command.clone()
            };
            json!({
                "command": recorded,
                "allowed": command_is_allowed(command, &security.allowed_commands),
            })
        })
        .collect();
    Value::Array(items).to_string()
}

pub fn command_is_allowed(command: &str, allowed: &[String]) -> bool {
    let Some(program) = command.split_whitespace().next() else {
        return false;
    };
    let program = program.rsplit('/').next().unwrap_or(program);
    allowed.iter().any(|a| a == program)
}

pub fn follow_ups_json(follow_ups: &[FollowUpRecord]) -> String {
    let items: Vec<Value> = follow_ups
        .iter()
        .map(|f| json!({ "message": f.message, "outcome": f.outcome }))
        .collect();
    Value::Array(items).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_allowlist_matches_program_name_only() {
        let allowed = vec!["git".to_string(), "cargo".to_string()];
        assert!(command_is_allowed("git status", &allowed));
        assert!(command_is_allowed("/usr/bin/git log", &allowed));
        assert!(command_is_allowed("cargo test --all", &allowed));
        assert!(!command_is_allowed("rm -rf /", &allowed));
        assert!(!command_is_allowed("", &allowed));
    }

    #[test]
    fn commands_json_tags_disallowed_entries() {
        let security = SecurityConfig::default();
        let raw = commands_json(
            &["git status".to_string(), "curl http://example.com".to_string()],
            &security,
        );
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed[0]["allowed"], true);
        assert_eq!(parsed[1]["allowed"], false);
    }
}
