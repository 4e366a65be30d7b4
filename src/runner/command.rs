//! Subprocess runner for agent CLIs.
//!
//! Builds an argv from the agent's argument template, runs it in the task's
//! working directory and captures its output with:
//! - Timeout enforcement (the child is killed on expiry)
//! - Cooperative cancellation
//! - ANSI / spinner cleanup and truncation of stdout

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::RunnerError;
use crate::runner::{AgentRunner, RunOptions, RunnerOutput};

/// Maximum captured output before truncation (1MB).
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Placeholder replaced by the prompt in argument templates.
const PROMPT_PLACEHOLDER: &str = "{prompt}";

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid ANSI regex")
});

static SPINNER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏].*$").expect("valid spinner regex"));

/// How model / effort options are spelled on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Claude,
    Codex,
    Generic,
}

/// Runs an agent CLI as a child process.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    name: String,
    command: String,
    args: Vec<String>,
    model: Option<String>,
    reasoning_effort: Option<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    flavor: Flavor,
}

impl CommandRunner {
    /// Build a runner from an agent definition, filling in the default
    /// argument template for known CLIs.
    pub fn from_agent(name: &str, agent: &AgentConfig) -> Self {
        let flavor = match agent.command.as_str() {
            "claude" => Flavor::Claude,
            "codex" => Flavor::Codex,
            _ => Flavor::Generic,
        };

        let args = if !agent.args.is_empty() {
            agent.args.clone()
        } else {
            match flavor {
                Flavor::Claude => [
                    "-p",
                    PROMPT_PLACEHOLDER,
                    "--print",
                    "--permission-mode",
                    "acceptEdits",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                Flavor::Codex => [
                    "exec",
                    PROMPT_PLACEHOLDER,
                    "--full-auto",
                    "--skip-git-repo-check",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                Flavor::Generic => vec![PROMPT_PLACEHOLDER.to_string()],
            }
        };

        Self {
            name: name.to_string(),
            command: agent.command.clone(),
            args,
            model: agent.model.clone(),
            reasoning_effort: agent.reasoning_effort.clone(),
            env: agent.env.clone(),
            timeout: agent.timeout(),
            flavor,
        }
    }

    /// Set the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the executable can be found on `PATH`.
    pub fn is_available(&self) -> bool {
        which::which(&self.command).is_ok()
    }

    /// Full argv for a prompt. Call options override configured values.
    pub fn build_command(&self, prompt: &str, options: &RunOptions) -> Vec<String> {
        let model = option_str(options, "model").or(self.model.clone());
        let effort = option_str(options, "reasoning_effort").or(self.reasoning_effort.clone());

        let mut cmd = vec![self.command.clone()];

        if self.flavor == Flavor::Codex
            && let Some(ref model) = model
        {
            cmd.push("-m".to_string());
            cmd.push(model.clone());
        }

        for arg in &self.args {
            if arg == PROMPT_PLACEHOLDER {
                cmd.push(prompt.to_string());
            } else {
                cmd.push(arg.clone());
            }
        }

        match self.flavor {
            Flavor::Claude => {
                if let Some(model) = model {
                    cmd.push("--model".to_string());
                    cmd.push(model);
                }
                if let Some(tools) = option_str(options, "allowed_tools") {
                    cmd.push("--allowedTools".to_string());
                    cmd.push(tools);
                }
            }
            Flavor::Codex => {
                if let Some(effort) = effort {
                    cmd.push("--reasoning-effort".to_string());
                    cmd.push(effort);
                }
            }
            Flavor::Generic => {}
        }

        cmd
    }

    async fn execute(
        &self,
        argv: &[String],
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunnerOutput, RunnerError> {
        let (program, rest) = argv.split_first().ok_or_else(|| RunnerError::SpawnFailed {
            command: self.command.clone(),
            reason: "empty command line".to_string(),
        })?;

        let mut command = Command::new(program);
        command
            .args(rest)
            .current_dir(cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| RunnerError::SpawnFailed {
            command: program.clone(),
            reason: e.to_string(),
        })?;

        // Dropping the wait future kills the child (kill_on_drop).
        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(
                    runner = %self.name,
                    timeout = ?self.timeout,
                    "Agent command timed out"
                );
                return Ok(RunnerOutput::failure(format!(
                    "Command timed out after {:?}",
                    self.timeout
                )));
            }
            _ = cancel.cancelled() => {
                return Err(RunnerError::Cancelled { name: self.name.clone() });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            Ok(RunnerOutput::success(truncate_output(&clean_output(&stdout))))
        } else {
            let code = output.status.code().unwrap_or(-1);
            let error = if stderr.trim().is_empty() {
                format!("exit code {code}")
            } else {
                truncate_output(stderr.trim())
            };
            Ok(RunnerOutput {
                success: false,
                output: truncate_output(&clean_output(&stdout)),
                error,
            })
        }
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        prompt: &str,
        cwd: &Path,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunnerOutput, RunnerError> {
        let argv = self.build_command(prompt, options);
        tracing::debug!(
            runner = %self.name,
            command = %argv.iter().take(3).cloned().collect::<Vec<_>>().join(" "),
            cwd = %cwd.display(),
            "Running agent command"
        );
        self.execute(&argv, cwd, cancel).await
    }
}

fn option_str(options: &RunOptions, key: &str) -> Option<String> {
    options
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Strip ANSI escapes and spinner lines.
pub fn clean_output(output: &str) -> String {
    let without_ansi = ANSI_RE.replace_all(output, "");
    let without_spinners = SPINNER_RE.replace_all(&without_ansi, "");
    without_spinners.trim().to_string()
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_SIZE {
        return output.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n... (output truncated)", &output[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(command: &str) -> AgentConfig {
        AgentConfig {
            command: command.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn claude_default_template() {
        let mut cfg = agent("claude");
        cfg.model = Some("sonnet".to_string());
        let runner = CommandRunner::from_agent("claude", &cfg);

        let cmd = runner.build_command("do it", &RunOptions::new());
        assert_eq!(
            cmd,
            vec![
                "claude",
                "-p",
                "do it",
                "--print",
                "--permission-mode",
                "acceptEdits",
                "--model",
                "sonnet"
            ]
        );
    }

    #[test]
    fn codex_template_with_model_and_effort() {
        let mut cfg = agent("codex");
        cfg.model = Some("o3".to_string());
        cfg.reasoning_effort = Some("high".to_string());
        let runner = CommandRunner::from_agent("codex", &cfg);

        let cmd = runner.build_command("fix", &RunOptions::new());
        assert_eq!(
            cmd,
            vec![
                "codex",
                "-m",
                "o3",
                "exec",
                "fix",
                "--full-auto",
                "--skip-git-repo-check",
                "--reasoning-effort",
                "high"
            ]
        );
    }

    #[test]
    fn options_override_configured_model() {
        let mut cfg = agent("claude");
        cfg.model = Some("sonnet".to_string());
        let runner = CommandRunner::from_agent("claude", &cfg);

        let mut opts = RunOptions::new();
        opts.insert("model".to_string(), serde_json::json!("opus"));
        let cmd = runner.build_command("x", &opts);
        assert_eq!(cmd[cmd.len() - 1], "opus");
    }

    #[test]
    fn custom_args_template() {
        let mut cfg = agent("my-agent");
        cfg.args = vec!["--input".to_string(), "{prompt}".to_string()];
        let runner = CommandRunner::from_agent("mine", &cfg);
        assert_eq!(
            runner.build_command("p", &RunOptions::new()),
            vec!["my-agent", "--input", "p"]
        );
    }

    #[test]
    fn clean_output_strips_ansi_and_spinners() {
        let raw = "\x1b[32mdone\x1b[0m\n⠋ thinking...\nresult\n";
        assert_eq!(clean_output(raw), "done\n\nresult");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_OUTPUT_SIZE);
        let out = truncate_output(&long);
        assert!(out.ends_with("(output truncated)"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_and_captures_stdout() {
        let mut cfg = agent("echo");
        cfg.args = vec!["hello".to_string(), "{prompt}".to_string()];
        let runner = CommandRunner::from_agent("echo", &cfg);

        let out = runner
            .run(
                "world",
                Path::new("."),
                &RunOptions::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output, "hello world");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_logical_failure() {
        let mut cfg = agent("sh");
        cfg.args = vec!["-c".to_string(), "echo oops >&2; exit 3".to_string()];
        let runner = CommandRunner::from_agent("sh", &cfg);

        let out = runner
            .run("", Path::new("."), &RunOptions::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.error, "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_yields_failed_output() {
        let mut cfg = agent("sleep");
        cfg.args = vec!["5".to_string()];
        let runner =
            CommandRunner::from_agent("sleep", &cfg).with_timeout(Duration::from_millis(100));

        let out = runner
            .run("", Path::new("."), &RunOptions::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.error.contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_is_runner_error() {
        let mut cfg = agent("sleep");
        cfg.args = vec!["5".to_string()];
        let runner = CommandRunner::from_agent("sleep", &cfg);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner
            .run("", Path::new("."), &RunOptions::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let runner = CommandRunner::from_agent("ghost", &agent("definitely-not-a-real-binary-xyz"));
        assert!(!runner.is_available());

        let err = runner
            .run("", Path::new("."), &RunOptions::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::SpawnFailed { .. }));
    }
}
