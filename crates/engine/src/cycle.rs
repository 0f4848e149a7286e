#![forbid(unsafe_code)]

//! The cycle engine: one invocation advances one task by one transition.
//!
//! Every cycle starts from a fresh `CycleContext` rehydrated from the store;
//! nothing cycle-mutable lives outside it. The engine itself never mutates
//! task state on the agent's behalf — every mutation flows through the method
//! surface and its validator, with two bookkeeping exceptions: the advisory
//! lock and the audit entry.

use crate::audit;
use crate::config::{AgentConfig, Config, ConfigError};
use crate::handshake::{FollowUpChannel, HandshakeEnforcer, HandshakeReport};
use crate::llm::{LlmOutput, LlmRequest, LlmRunner};
use crate::prompt::build_prompt;
use crate::redact::redact;
use cd_core::select::{SelectError, SelectionPolicy, select_next};
use cd_core::state::TaskState;
use cd_mcp::{AgentGrant, SurfaceServer};
use cd_storage::{
    ArtifactRow, CycleOutcome, NewAuditEntry, RequirementRow, SqliteStore, StoreError, TaskRow,
};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum EngineError {
    Store(StoreError),
    Config(ConfigError),
    Selection(SelectError),
    NoAgentConfigured { state: TaskState },
    Surface(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Selection(err) => write!(f, "task selection failed: {err}"),
            Self::NoAgentConfigured { state } => {
                write!(f, "no agent configured for state {state}")
            }
            Self::Surface(message) => write!(f, "method surface: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<SelectError> for EngineError {
    fn from(value: SelectError) -> Self {
        Self::Selection(value)
    }
}

#[derive(Clone, Debug)]
pub struct PlanSnapshot {
    pub path: PathBuf,
    pub sha256: String,
    pub size: usize,
}

/// Everything one cycle may know, rehydrated from durable storage at cycle
/// start. Dropped at cycle end; the next cycle rebuilds from scratch.
#[derive(Clone, Debug)]
pub struct CycleContext {
    pub cycle_id: String,
    pub started_at_ms: i64,
    pub deadline_ms: Option<i64>,
    pub selection_reason: String,
    pub task: TaskRow,
    pub latest_artifacts: Vec<ArtifactRow>,
    pub requirements: Vec<RequirementRow>,
    pub plan: Option<PlanSnapshot>,
}

#[derive(Clone, Debug)]
pub struct CycleResult {
    pub cycle_id: String,
    pub task_id: String,
    pub prev_state: TaskState,
    pub next_state: TaskState,
    pub artifacts_created: Vec<String>,
    pub duration_ms: i64,
    pub outcome: CycleOutcome,
    pub dry_run: bool,
    pub note: Option<String>,
}

pub struct CycleEngine<'a> {
    config: &'a Config,
    store: SqliteStore,
    runner: Box<dyn LlmRunner>,
}

impl<'a> CycleEngine<'a> {
    pub fn new(
        config: &'a Config,
        store: SqliteStore,
        runner: Box<dyn LlmRunner>,
    ) -> Result<Self, EngineError> {
        let mut engine = Self {
            config,
            store,
            runner,
        };
        // The agents table mirrors the config role table so the stdio surface
        // and the status views resolve grants from the same source.
        for (role, agent) in &config.agents {
            engine.store.upsert_agent(&config.agent_row(role, agent))?;
        }
        Ok(engine)
    }

    pub fn execute(
        &mut self,
        dry_run: bool,
        timeout_override: Option<Duration>,
    ) -> Result<CycleResult, EngineError> {
        let started = Instant::now();
        let started_at_ms = now_ms();
        let policy = self.config.selection.to_policy()?;

        let snapshot = self.store.selection_snapshot()?;
        let selection = select_next(&snapshot, &policy, started_at_ms)?;
        let task = self.store.get_task(&selection.task_id)?;
        let prev_state = task.state;

        let Some((role_name, agent)) = self.config.role_for_state(task.state) else {
            return Err(EngineError::NoAgentConfigured { state: task.state });
        };
        let role_name = role_name.to_string();
        let agent = agent.clone();

        let timebox_s = timeout_override
            .map(|d| d.as_secs())
            .unwrap_or(self.config.development.cycle_timebox_seconds);
        let deadline_ms = (timebox_s > 0).then(|| started_at_ms + timebox_s as i64 * 1_000);

        if dry_run {
            // Dry runs never touch the store: no counter bump, no lock, no
            // audit entry. The predicted state is the first legal successor.
            let ctx = self.rehydrate(
                format!("CYC-DRY-{started_at_ms}"),
                started_at_ms,
                deadline_ms,
                task,
                selection.reason,
            )?;
            let _prompt = build_prompt(&ctx, &role_name, &agent);
            let predicted = prev_state.successors().first().copied().unwrap_or(prev_state);
            return Ok(CycleResult {
                cycle_id: ctx.cycle_id,
                task_id: ctx.task.id,
                prev_state,
                next_state: predicted,
                artifacts_created: Vec::new(),
                duration_ms: started.elapsed().as_millis() as i64,
                outcome: CycleOutcome::Success,
                dry_run: true,
                note: Some("dry run: no state was changed".to_string()),
            });
        }

        let cycle_id = self.store.next_cycle_id()?;
        let ctx = self.rehydrate(
            cycle_id.clone(),
            started_at_ms,
            deadline_ms,
            task,
            selection.reason,
        )?;

        self.store.acquire_task_lock(&ctx.task.id, &cycle_id)?;
        let result = self.run_locked(&ctx, &role_name, &agent, policy, started);
        // Release on every path; a crash leaves the row for `tasks unlock`.
        let _ = self.store.release_task_lock(&ctx.task.id, &cycle_id);
        result
    }

    fn run_locked(
        &mut self,
        ctx: &CycleContext,
        role_name: &str,
        agent: &AgentConfig,
        policy: SelectionPolicy,
        started: Instant,
    ) -> Result<CycleResult, EngineError> {
        let prompt = build_prompt(ctx, role_name, agent);
        let grant = grant_for(role_name, agent)?;

        let server = SurfaceServer::spawn(
            self.store.db_path().to_path_buf(),
            grant,
            policy,
            Some(self.config.plan_file.clone()),
            ctx.deadline_ms,
            self.config.method_surface_port,
        )
        .map_err(EngineError::Surface)?;
        let surface_addr = server.addr();

        let capture_dir = self.config.workspace.join("runs").join(&ctx.cycle_id);
        let llm_result = self.invoke_runner(ctx, role_name, &prompt, surface_addr, &capture_dir);

        let report = {
            let enforcer = HandshakeEnforcer::new(&self.config.completion);
            let mut channel = RunnerFollowUp {
                runner: self.runner.as_mut(),
                surface_addr,
                role: role_name,
                capture_dir: capture_dir.clone(),
                timeout: Duration::from_secs(self.config.completion.timeout_seconds.max(1)),
                redact_captures: self.config.security.redact_in_logs,
                attempt: 0,
            };
            enforcer.enforce(
                &mut self.store,
                &ctx.task.id,
                ctx.task.state,
                ctx.started_at_ms,
                &mut channel,
            )?
        };

        server.stop();

        let entry = self.assemble_audit_entry(ctx, role_name, &llm_result, &report);
        self.store.append_audit(entry)?;

        let artifacts_created = report
            .artifacts_created
            .iter()
            .map(|a| format!("{} v{}", a.name, a.version))
            .collect();
        let outcome = if report.success {
            CycleOutcome::Success
        } else {
            CycleOutcome::Error
        };

        Ok(CycleResult {
            cycle_id: ctx.cycle_id.clone(),
            task_id: ctx.task.id.clone(),
            prev_state: ctx.task.state,
            next_state: report.final_state,
            artifacts_created,
            duration_ms: started.elapsed().as_millis() as i64,
            outcome,
            dry_run: false,
            note: Some(report.note.clone()),
        })
    }

    fn invoke_runner(
        &mut self,
        ctx: &CycleContext,
        role_name: &str,
        prompt: &str,
        surface_addr: SocketAddr,
        capture_dir: &PathBuf,
    ) -> Result<LlmOutput, String> {
        let timeout = runner_timeout(
            self.config.llm.timeout_seconds,
            ctx.deadline_ms,
        );
        let mut last = Err("runner not invoked".to_string());
        for _attempt in 0..=self.config.llm.max_retries {
            let request = LlmRequest {
                prompt,
                surface_addr,
                role: role_name,
                capture_dir,
                timeout,
                redact_captures: self.config.security.redact_in_logs,
            };
            last = self.runner.invoke(&request);
            if last.is_ok() {
                break;
            }
        }
        last
    }

    fn assemble_audit_entry(
        &self,
        ctx: &CycleContext,
        role_name: &str,
        llm_result: &Result<LlmOutput, String>,
        report: &HandshakeReport,
    ) -> NewAuditEntry {
        let commands = llm_result
            .as_ref()
            .map(|o| o.commands.clone())
            .unwrap_or_default();

        let mut note_parts = Vec::new();
        match llm_result {
            Ok(output) if !output.summary.is_empty() => {
                note_parts.push(format!("runner: {}", truncate(&output.summary, 200)));
            }
            Ok(_) => {}
            Err(e) => note_parts.push(format!("runner error: {e}")),
        }
        note_parts.push(report.note.clone());
        let mut note = note_parts.join("; ");
        if self.config.security.redact_in_logs {
            note = redact(&note);
        }

        let outcome = if report.success {
            CycleOutcome::Success
        } else {
            CycleOutcome::Error
        };

        NewAuditEntry {
            cycle_id: ctx.cycle_id.clone(),
            task_id: ctx.task.id.clone(),
            prev_state: Some(ctx.task.state),
            next_state: Some(report.final_state),
            actor: Some(role_name.to_string()),
            selection_reason: Some(ctx.selection_reason.clone()),
            inputs_summary: Some(audit::inputs_summary(ctx)),
            outputs_summary: Some(audit::outputs_summary(&report.artifacts_created)),
            commands_json: audit::commands_json(&commands, &self.config.security),
            result: outcome,
            note: Some(note),
            follow_ups_json: audit::follow_ups_json(&report.follow_ups),
        }
    }

    fn rehydrate(
        &self,
        cycle_id: String,
        started_at_ms: i64,
        deadline_ms: Option<i64>,
        task: TaskRow,
        selection_reason: String,
    ) -> Result<CycleContext, EngineError> {
        let latest_artifacts = self.store.latest_artifacts(&task.id)?;
        let requirements = self.store.requirements_for_task(&task.id)?;
        let plan = plan_snapshot(&self.config.plan_file);
        Ok(CycleContext {
            cycle_id,
            started_at_ms,
            deadline_ms,
            selection_reason,
            task,
            latest_artifacts,
            requirements,
            plan,
        })
    }

    pub fn store_mut(&mut self) -> &mut SqliteStore {
        &mut self.store
    }
}

/// Follow-up channel backed by a fresh bounded runner invocation against the
/// still-running surface.
struct RunnerFollowUp<'a> {
    runner: &'a mut dyn LlmRunner,
    surface_addr: SocketAddr,
    role: &'a str,
    capture_dir: PathBuf,
    timeout: Duration,
    redact_captures: bool,
    attempt: u32,
}

impl FollowUpChannel for RunnerFollowUp<'_> {
    fn send(&mut self, message: &str) -> Result<(), String> {
        self.attempt += 1;
        let dir = self.capture_dir.join(format!("follow_up_{}", self.attempt));
        let request = LlmRequest {
            prompt: message,
            surface_addr: self.surface_addr,
            role: self.role,
            capture_dir: &dir,
            timeout: self.timeout,
            redact_captures: self.redact_captures,
        };
        self.runner.invoke(&request).map(|_| ())
    }
}

fn grant_for(role_name: &str, agent: &AgentConfig) -> Result<AgentGrant, EngineError> {
    let parse = |names: &[String], field: &str| -> Result<Vec<TaskState>, EngineError> {
        names
            .iter()
            .map(|name| {
                TaskState::parse(name).ok_or_else(|| {
                    EngineError::Config(ConfigError::Invalid(format!(
                        "agent '{role_name}' references unknown state '{name}' in {field}"
                    )))
                })
            })
            .collect()
    };
    Ok(AgentGrant {
        role: role_name.to_string(),
        allowed_states: parse(&agent.allowed_states, "allowed_states")?,
        can_transition_to: parse(&agent.can_transition_to, "can_transition_to")?,
        can_read_plan: agent.capabilities.can_read_plan,
        can_execute_commands: agent.capabilities.can_execute_commands,
        can_update_artifacts: agent.capabilities.can_update_artifacts,
    })
}

fn plan_snapshot(path: &PathBuf) -> Option<PlanSnapshot> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    Some(PlanSnapshot {
        path: path.clone(),
        sha256: format!("{:x}", hasher.finalize()),
        size: content.len(),
    })
}

fn runner_timeout(llm_timeout_s: u64, deadline_ms: Option<i64>) -> Duration {
    let configured = Duration::from_secs(llm_timeout_s.max(1));
    let Some(deadline_ms) = deadline_ms else {
        return configured;
    };
    let remaining_ms = deadline_ms.saturating_sub(now_ms()).max(1_000);
    configured.min(Duration::from_millis(remaining_ms as u64))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(i64::MAX as u128) as i64
}
