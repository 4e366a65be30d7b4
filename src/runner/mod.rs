//! Agent runners: the capability that executes one prompt.
//!
//! The executor only sees the [`AgentRunner`] trait. Concrete runners are
//! registered in a [`RunnerRegistry`] at startup, keyed by agent identity.

pub mod command;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::RunnerError;

pub use command::CommandRunner;

/// Free-form per-call options (model overrides and the like).
pub type RunOptions = serde_json::Map<String, serde_json::Value>;

/// Outcome of a runner invocation that completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerOutput {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl RunnerOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }
}

/// Executes one fully-formed prompt to completion.
///
/// `Err` means the invocation itself broke (spawn failure, cancellation);
/// a run that finished but reported failure is `Ok` with `success == false`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Implementation name, recorded on every task result.
    fn name(&self) -> &str;

    async fn run(
        &self,
        prompt: &str,
        cwd: &Path,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunnerOutput, RunnerError>;
}

/// Agent identity → runner.
#[derive(Default, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn AgentRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`CommandRunner`] for every configured agent.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (name, agent) in &config.agents {
            registry.register(name, Arc::new(CommandRunner::from_agent(name, agent)));
        }
        registry
    }

    /// Register (or replace) the runner for an agent.
    pub fn register(&mut self, agent: impl Into<String>, runner: Arc<dyn AgentRunner>) {
        let agent = agent.into();
        tracing::debug!(agent = %agent, runner = runner.name(), "Registered runner");
        self.runners.insert(agent, runner);
    }

    pub fn get(&self, agent: &str) -> Option<Arc<dyn AgentRunner>> {
        self.runners.get(agent).cloned()
    }

    pub fn has(&self, agent: &str) -> bool {
        self.runners.contains_key(agent)
    }

    /// Registered agent names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.runners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    struct EchoRunner;

    #[async_trait]
    impl AgentRunner for EchoRunner {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(
            &self,
            prompt: &str,
            _cwd: &Path,
            _options: &RunOptions,
            _cancel: &CancellationToken,
        ) -> Result<RunnerOutput, RunnerError> {
            Ok(RunnerOutput::success(prompt))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = RunnerRegistry::new();
        registry.register("stub", Arc::new(EchoRunner));

        assert!(registry.has("stub"));
        assert!(!registry.has("missing"));
        assert_eq!(registry.get("stub").unwrap().name(), "echo");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn from_config_registers_every_agent() {
        let mut config = Config::default();
        for name in ["codex", "claude"] {
            config.agents.insert(
                name.to_string(),
                AgentConfig {
                    command: name.to_string(),
                    ..Default::default()
                },
            );
        }

        let registry = RunnerRegistry::from_config(&config);
        assert_eq!(registry.list(), vec!["claude", "codex"]);
    }

    #[tokio::test]
    async fn runner_output_constructors() {
        let out = EchoRunner
            .run(
                "hi",
                Path::new("."),
                &RunOptions::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, RunnerOutput::success("hi"));
        assert!(!RunnerOutput::failure("boom").success);
    }
}
