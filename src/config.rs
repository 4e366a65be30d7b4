//! Configuration types.
//!
//! The configuration is read from a TOML file, validated once, and then
//! handed to the executor and workflow engine as read-only data.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix for workflow jump directives.
pub const GOTO_PREFIX: &str = "goto:";

/// Default per-invocation agent timeout, in seconds.
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 300;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// An external agent CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable to run (`claude`, `codex`, or any command).
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Argument template. `{prompt}` is replaced with the full prompt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Per-invocation timeout in seconds (0 = default).
    #[serde(default)]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Extra environment variables for the child process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        if self.timeout == 0 {
            Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout)
        }
    }
}

/// A role binds a prompt template to an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleConfig {
    pub agent: String,
    /// Prompt file, relative to the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
    /// Inline prompt template; takes precedence over `prompt_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Ordered workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// Maximum visits per step before the run is aborted.
    #[serde(default = "default_max_loops")]
    pub max_loops: usize,
    /// Role that receives the original user request.
    #[serde(default = "default_planner_role")]
    pub planner_role: String,
    /// Output slot that is parsed as a plan.
    #[serde(default = "default_plan_output")]
    pub plan_output: String,
}

fn default_max_loops() -> usize {
    10
}

fn default_planner_role() -> String {
    "planner".to_string()
}

fn default_plan_output() -> String {
    "plan.json".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            name: None,
            steps: Vec::new(),
            max_loops: default_max_loops(),
            planner_role: default_planner_role(),
            plan_output: default_plan_output(),
        }
    }
}

/// One workflow step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default)]
    pub per_task: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    /// Force or disable verdict checking. Defaults to role-name detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<bool>,
}

impl StepConfig {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn per_task(mut self) -> Self {
        self.per_task = true;
        self
    }

    pub fn on_fail(mut self, directive: impl Into<String>) -> Self {
        self.on_fail = Some(directive.into());
        self
    }

    pub fn on_success(mut self, directive: impl Into<String>) -> Self {
        self.on_success = Some(directive.into());
        self
    }

    /// Whether this step's success is decided by a verdict in its output.
    pub fn is_gate(&self) -> bool {
        self.gate.unwrap_or_else(|| {
            let role = self.role.to_lowercase();
            role.ends_with("validator") || role.ends_with("reviewer")
        })
    }
}

/// Retry policy applied to every runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_max_workers() -> usize {
    5
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

/// Session persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
            db_path: None,
            recovery: RecoveryConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Resolve the database path: explicit setting, then `~/.config/brainchain/sessions.db`.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(ref path) = self.db_path {
            return path.clone();
        }
        config_dir().join("sessions.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub auto_detect: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { auto_detect: true }
    }
}

/// Default configuration directory.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("brainchain"))
        .unwrap_or_else(|| PathBuf::from(".brainchain"))
}

impl Config {
    /// Parse, default and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, or from `config_dir()/config.toml` when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config_dir().join("config.toml"));
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::MissingRequired {
            key: "config".to_string(),
            hint: format!("Could not read {}: {e}", path.display()),
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Fill zero values with their defaults.
    pub fn apply_defaults(&mut self) {
        if self.parallel.max_workers == 0 {
            self.parallel.max_workers = default_max_workers();
        }
        if self.session.retention_days == 0 {
            self.session.retention_days = default_retention_days();
        }
        if self.workflow.max_loops == 0 {
            self.workflow.max_loops = default_max_loops();
        }
        for agent in self.agents.values_mut() {
            if agent.timeout == 0 {
                agent.timeout = DEFAULT_AGENT_TIMEOUT_SECS;
            }
        }
    }

    /// Environment overrides: `BRAINCHAIN_DB_PATH`, `BRAINCHAIN_MAX_WORKERS`,
    /// `BRAINCHAIN_MAX_RETRIES`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("BRAINCHAIN_DB_PATH") {
            self.session.db_path = Some(PathBuf::from(path));
        }
        if let Some(workers) = env_parse::<usize>("BRAINCHAIN_MAX_WORKERS")
            && workers > 0
        {
            self.parallel.max_workers = workers;
        }
        if let Some(retries) = env_parse::<u32>("BRAINCHAIN_MAX_RETRIES") {
            self.retry_policy.max_retries = retries;
        }
    }

    /// Check cross-references between agents, roles and workflow steps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, agent) in &self.agents {
            if agent.command.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("agents.{name}.command"),
                    hint: "Every agent needs an executable".to_string(),
                });
            }
        }

        for (name, role) in &self.roles {
            if role.agent.is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("roles.{name}.agent"),
                    hint: "Every role must name an agent".to_string(),
                });
            }
            if !self.agents.contains_key(&role.agent) {
                return Err(ConfigError::InvalidValue {
                    key: format!("roles.{name}.agent"),
                    message: format!("undefined agent '{}'", role.agent),
                });
            }
        }

        for (i, step) in self.workflow.steps.iter().enumerate() {
            if !self.roles.contains_key(&step.role) {
                return Err(ConfigError::InvalidWorkflow(format!(
                    "step {} uses undefined role '{}'",
                    i + 1,
                    step.role
                )));
            }
            for directive in [&step.on_fail, &step.on_success].into_iter().flatten() {
                if !directive.starts_with(GOTO_PREFIX) || directive.len() == GOTO_PREFIX.len() {
                    return Err(ConfigError::InvalidWorkflow(format!(
                        "step {} has malformed jump directive '{directive}' (expected goto:<role>)",
                        i + 1
                    )));
                }
            }
        }

        Ok(())
    }

    /// A JSON snapshot of this configuration, stored with each session.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Read every role's prompt template. Inline prompts win over files;
/// relative files resolve against `base_dir`.
pub fn load_prompts(
    config: &Config,
    base_dir: &Path,
) -> Result<HashMap<String, String>, ConfigError> {
    let mut prompts = HashMap::new();
    for (name, role) in &config.roles {
        let text = match (&role.prompt, &role.prompt_file) {
            (Some(inline), _) => inline.clone(),
            (None, Some(file)) => {
                let path = base_dir.join(file);
                std::fs::read_to_string(&path).map_err(|e| ConfigError::MissingRequired {
                    key: format!("roles.{name}.prompt_file"),
                    hint: format!("Could not read {}: {e}", path.display()),
                })?
            }
            (None, None) => String::new(),
        };
        prompts.insert(name.clone(), text);
    }
    Ok(prompts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[agents.claude]
command = "claude"
model = "sonnet"

[agents.codex]
command = "codex"
timeout = 60

[roles.planner]
agent = "claude"
prompt = "You plan."

[roles.code_reviewer]
agent = "codex"
prompt_file = "reviewer.md"

[workflow]
max_loops = 4

[[workflow.steps]]
role = "planner"
output = "plan.json"

[[workflow.steps]]
role = "code_reviewer"
on_fail = "goto:planner"
"#;

    #[test]
    fn parses_and_applies_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents["claude"].timeout(), Duration::from_secs(300));
        assert_eq!(config.agents["codex"].timeout(), Duration::from_secs(60));
        assert_eq!(config.retry_policy.max_retries, 3);
        assert_eq!(config.retry_policy.retry_delay, 5);
        assert_eq!(config.parallel.max_workers, 5);
        assert_eq!(config.workflow.max_loops, 4);
        assert_eq!(config.workflow.plan_output, "plan.json");
        assert_eq!(config.workflow.steps.len(), 2);
        assert_eq!(
            config.workflow.steps[1].on_fail.as_deref(),
            Some("goto:planner")
        );
    }

    #[test]
    fn rejects_role_with_unknown_agent() {
        let toml = r#"
[roles.planner]
agent = "ghost"
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_step_with_unknown_role() {
        let toml = r#"
[agents.claude]
command = "claude"

[[workflow.steps]]
role = "planner"
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWorkflow(_)));
    }

    #[test]
    fn rejects_malformed_jump_directive() {
        let toml = r#"
[agents.claude]
command = "claude"

[roles.planner]
agent = "claude"

[[workflow.steps]]
role = "planner"
on_fail = "planner"
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("malformed jump directive"));
    }

    #[test]
    fn rejects_invalid_toml() {
        let err = Config::from_toml_str("[agents.claude\ncommand=").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn gate_detection_by_role_name() {
        assert!(StepConfig::new("plan_validator").is_gate());
        assert!(StepConfig::new("code_reviewer").is_gate());
        assert!(StepConfig::new("reviewer").is_gate());
        assert!(!StepConfig::new("implementer").is_gate());

        let mut forced = StepConfig::new("implementer");
        forced.gate = Some(true);
        assert!(forced.is_gate());

        let mut disabled = StepConfig::new("reviewer");
        disabled.gate = Some(false);
        assert!(!disabled.is_gate());
    }

    #[test]
    fn load_prompts_prefers_inline_and_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reviewer.md"), "You review.").unwrap();

        let config = Config::from_toml_str(SAMPLE).unwrap();
        let prompts = load_prompts(&config, dir.path()).unwrap();
        assert_eq!(prompts["planner"], "You plan.");
        assert_eq!(prompts["code_reviewer"], "You review.");
    }

    #[test]
    fn load_prompts_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let err = load_prompts(&config, dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn explicit_db_path_wins() {
        let session = SessionConfig {
            db_path: Some(PathBuf::from("/tmp/x.db")),
            ..Default::default()
        };
        assert_eq!(session.resolved_db_path(), PathBuf::from("/tmp/x.db"));
    }
}
