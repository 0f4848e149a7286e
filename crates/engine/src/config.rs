#![forbid(unsafe_code)]

//! YAML configuration. Unknown keys are rejected at load time; everything
//! else carries a default so a bare `cadence.yaml` is a valid starting point.

use cd_core::select::{SelectionAlgorithm, SelectionPolicy, TieBreaker};
use cd_core::state::TaskState;
use cd_storage::AgentRow;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "config io: {err}"),
            Self::Yaml(err) => write!(f, "config parse: {err}"),
            Self::Invalid(message) => write!(f, "config invalid: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_plan_file")]
    pub plan_file: PathBuf,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default)]
    pub method_surface_port: u16,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub development: DevelopmentConfig,
    /// Role table. A `BTreeMap` keeps role resolution deterministic.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plan_file: default_plan_file(),
            workspace: default_workspace(),
            database: default_database(),
            method_surface_port: 0,
            llm: LlmConfig::default(),
            selection: SelectionConfig::default(),
            completion: CompletionConfig::default(),
            security: SecurityConfig::default(),
            development: DevelopmentConfig::default(),
            agents: BTreeMap::new(),
        }
    }
}

fn default_plan_file() -> PathBuf {
    PathBuf::from("plan.md")
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_database() -> PathBuf {
    PathBuf::from("cadence.db")
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default = "default_llm_primary")]
    pub primary: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_runners")]
    pub runners: BTreeMap<String, RunnerCommand>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary: default_llm_primary(),
            timeout_seconds: default_llm_timeout(),
            max_retries: default_llm_max_retries(),
            runners: default_runners(),
        }
    }
}

fn default_llm_primary() -> String {
    "claude".to_string()
}

fn default_llm_timeout() -> u64 {
    300
}

fn default_llm_max_retries() -> u32 {
    1
}

fn default_runners() -> BTreeMap<String, RunnerCommand> {
    let mut runners = BTreeMap::new();
    runners.insert(
        "claude".to_string(),
        RunnerCommand {
            command: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
        },
    );
    runners
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_true")]
    pub dependency_strict: bool,
    #[serde(default = "default_true")]
    pub prefer_leaf_tasks: bool,
    #[serde(default = "default_tie_breaker")]
    pub tie_breaker: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            dependency_strict: true,
            prefer_leaf_tasks: true,
            tie_breaker: default_tie_breaker(),
        }
    }
}

impl SelectionConfig {
    pub fn to_policy(&self) -> Result<SelectionPolicy, ConfigError> {
        let Some(algorithm) = SelectionAlgorithm::parse(&self.algorithm) else {
            return Err(ConfigError::Invalid(format!(
                "unknown selection algorithm: {}",
                self.algorithm
            )));
        };
        let Some(tie_breaker) = TieBreaker::parse(&self.tie_breaker) else {
            return Err(ConfigError::Invalid(format!(
                "unknown tie breaker: {}",
                self.tie_breaker
            )));
        };
        Ok(SelectionPolicy {
            algorithm,
            dependency_strict: self.dependency_strict,
            prefer_leaf_tasks: self.prefer_leaf_tasks,
            tie_breaker,
        })
    }
}

fn default_algorithm() -> String {
    "priority_dependency".to_string()
}

fn default_tie_breaker() -> String {
    "oldest_updated".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_completion_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub require_explicit_state_update: bool,
    #[serde(default = "default_follow_up_template")]
    pub follow_up_template: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_completion_retries(),
            retry_delay_seconds: default_retry_delay(),
            timeout_seconds: default_completion_timeout(),
            require_explicit_state_update: true,
            follow_up_template: default_follow_up_template(),
        }
    }
}

fn default_completion_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    5
}

fn default_completion_timeout() -> u64 {
    600
}

fn default_follow_up_template() -> String {
    "Are you finished? The task state has not been updated. Either declare the \
     transition via tasks.update_state or append a note explaining why you are \
     not finished and what state the task should move to."
        .to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_true")]
    pub workspace_restriction: bool,
    #[serde(default = "default_true")]
    pub redact_in_logs: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            workspace_restriction: true,
            redact_in_logs: true,
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    ["git", "npm", "go", "python", "pytest", "cargo", "make"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevelopmentConfig {
    #[serde(default = "default_timebox")]
    pub cycle_timebox_seconds: u64,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            cycle_timebox_seconds: default_timebox(),
        }
    }
}

fn default_timebox() -> u64 {
    3600
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub description: String,
    pub allowed_states: Vec<String>,
    pub can_transition_to: Vec<String>,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub prompt_template: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub can_read_plan: bool,
    #[serde(default)]
    pub can_execute_commands: bool,
    #[serde(default)]
    pub can_update_artifacts: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.resolve_paths();
        config.validate()?;
        Ok(config)
    }

    /// Relative database/plan paths are anchored at the workspace.
    fn resolve_paths(&mut self) {
        if self.database.is_relative() {
            self.database = self.workspace.join(&self.database);
        }
        if self.plan_file.is_relative() {
            self.plan_file = self.workspace.join(&self.plan_file);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.selection.to_policy()?;

        if !self.llm.runners.contains_key(&self.llm.primary) {
            return Err(ConfigError::Invalid(format!(
                "llm.primary '{}' has no runner entry",
                self.llm.primary
            )));
        }

        for (role, agent) in &self.agents {
            for name in agent
                .allowed_states
                .iter()
                .chain(agent.can_transition_to.iter())
            {
                if TaskState::parse(name).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "agent '{role}' references unknown state '{name}'"
                    )));
                }
            }
            if agent.allowed_states.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "agent '{role}' has no allowed_states; it can never run"
                )));
            }
        }
        Ok(())
    }

    /// Resolves the role responsible for a task state. Roles are consulted in
    /// name order, so the answer is stable across runs.
    pub fn role_for_state(&self, state: TaskState) -> Option<(&str, &AgentConfig)> {
        self.agents.iter().find_map(|(name, agent)| {
            let handles = agent
                .allowed_states
                .iter()
                .any(|s| TaskState::parse(s) == Some(state));
            handles.then_some((name.as_str(), agent))
        })
    }

    pub fn agent_row(&self, role: &str, agent: &AgentConfig) -> AgentRow {
        AgentRow {
            role: role.to_string(),
            description: (!agent.description.is_empty()).then(|| agent.description.clone()),
            allowed_states: agent.allowed_states.clone(),
            can_transition_to: agent.can_transition_to.clone(),
            can_read_plan: agent.capabilities.can_read_plan,
            can_execute_commands: agent.capabilities.can_execute_commands,
            can_update_artifacts: agent.capabilities.can_update_artifacts,
            prompt_template: agent.prompt_template.clone(),
            updated_at_ms: 0,
        }
    }
}

/// The commented template `cd_engine init` writes.
pub fn default_config_yaml() -> &'static str {
    r#"# Cadence configuration.
# Unknown keys are rejected; delete what you do not need and keep defaults.

plan_file: plan.md
workspace: .
database: cadence.db

# Port for the cycle-scoped method surface. 0 picks an ephemeral port.
method_surface_port: 0

llm:
  primary: claude
  timeout_seconds: 300
  max_retries: 1
  runners:
    claude:
      command: claude
      args: ["-p", "--output-format", "json"]

selection:
  algorithm: priority_dependency
  dependency_strict: true
  prefer_leaf_tasks: true
  tie_breaker: oldest_updated

completion:
  max_retries: 2
  retry_delay_seconds: 5
  timeout_seconds: 600
  require_explicit_state_update: true

security:
  allowed_commands: [git, npm, go, python, pytest, cargo, make]
  workspace_restriction: true
  redact_in_logs: true

development:
  cycle_timebox_seconds: 3600

agents:
  architect:
    description: Plans work before implementation
    allowed_states: [ready_for_plan, planning]
    can_transition_to: [planning, ready_for_implementation, needs_fixes]
    capabilities:
      can_read_plan: true
      can_update_artifacts: true
  developer:
    description: Implements planned work and fixes findings
    allowed_states: [ready_for_implementation, implementing, needs_fixes, fixing]
    can_transition_to: [implementing, ready_for_code_review, fixing, needs_fixes]
    capabilities:
      can_read_plan: true
      can_execute_commands: true
      can_update_artifacts: true
  reviewer:
    description: Reviews changes and lands them
    allowed_states: [ready_for_code_review, reviewing, ready_for_commit, committing]
    can_transition_to: [reviewing, ready_for_commit, committing, DONE, needs_fixes]
    capabilities:
      can_execute_commands: true
      can_update_artifacts: true
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(test_name: &str, contents: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = base.join(format!("cd_engine_cfg_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("cadence.yaml");
        std::fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn default_template_parses_and_validates() {
        let path = temp_config("default_template", default_config_yaml());
        let config = Config::load(&path).expect("load default template");
        assert_eq!(config.llm.primary, "claude");
        assert_eq!(config.agents.len(), 3);
        assert!(config.role_for_state(TaskState::Planning).is_some());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let path = temp_config("unknown_keys", "plan_file: plan.md\nfrobnicate: true\n");
        let err = Config::load(&path).expect_err("expected rejection");
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn unknown_algorithm_is_fatal() {
        let path = temp_config(
            "unknown_algorithm",
            "selection:\n  algorithm: round_robin\n",
        );
        let err = Config::load(&path).expect_err("expected rejection");
        assert!(err.to_string().contains("unknown selection algorithm"));
    }

    #[test]
    fn agent_with_unknown_state_is_fatal() {
        let path = temp_config(
            "bad_agent_state",
            "agents:\n  dev:\n    allowed_states: [warp]\n    can_transition_to: []\n",
        );
        let err = Config::load(&path).expect_err("expected rejection");
        assert!(err.to_string().contains("unknown state 'warp'"));
    }

    #[test]
    fn role_resolution_is_name_ordered() {
        let yaml = r#"
agents:
  beta:
    allowed_states: [planning]
    can_transition_to: [ready_for_implementation]
  alpha:
    allowed_states: [planning]
    can_transition_to: [ready_for_implementation]
"#;
        let path = temp_config("role_order", yaml);
        let config = Config::load(&path).expect("load");
        let (role, _) = config
            .role_for_state(TaskState::Planning)
            .expect("role resolved");
        assert_eq!(role, "alpha");
    }

    #[test]
    fn relative_paths_anchor_at_workspace() {
        let path = temp_config(
            "relative_paths",
            "workspace: /tmp/cadence-ws\ndatabase: state/cadence.db\nplan_file: docs/plan.md\n",
        );
        let config = Config::load(&path).expect("load");
        assert_eq!(
            config.database,
            PathBuf::from("/tmp/cadence-ws/state/cadence.db")
        );
        assert_eq!(
            config.plan_file,
            PathBuf::from("/tmp/cadence-ws/docs/plan.md")
        );
    }
}
