//! Task executor: runs role prompts through agent runners.
//!
//! - `run_single()`: one task with bounded retries; runtime failures end up in the result
//! - `run_parallel()`: a batch on a bounded worker pool, results in input order

pub mod task;

pub use task::{Task, TaskResult};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ConfigError, RunnerError};
use crate::runner::{AgentRunner, RunOptions, RunnerRegistry};

/// Separator between the role template and the task prompt.
pub const PROMPT_SEPARATOR: &str = "\n\n---\n\n";

/// Error text recorded on tasks that were cancelled.
pub const CANCELLED: &str = "cancelled";

/// Runs tasks against the configured roles.
///
/// Cheap to clone; everything inside is read-only after construction.
#[derive(Clone)]
pub struct Executor {
    config: Arc<Config>,
    prompts: Arc<HashMap<String, String>>,
    registry: Arc<RunnerRegistry>,
    max_retries: u32,
    retry_delay: Duration,
    max_workers: usize,
}

impl Executor {
    /// Create an executor. Retry and pool settings come from `config`.
    pub fn new(
        config: Arc<Config>,
        prompts: HashMap<String, String>,
        registry: Arc<RunnerRegistry>,
    ) -> Self {
        let max_retries = config.retry_policy.max_retries;
        let retry_delay = Duration::from_secs(config.retry_policy.retry_delay);
        let max_workers = config.parallel.max_workers.max(1);
        Self {
            config,
            prompts: Arc::new(prompts),
            registry,
            max_retries,
            retry_delay,
            max_workers,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve `role` to its registered runner.
    fn resolve(&self, role: &str) -> Result<Arc<dyn AgentRunner>, ConfigError> {
        let role_config = self
            .config
            .roles
            .get(role)
            .ok_or_else(|| ConfigError::UnknownRole(role.to_string()))?;
        let agent = role_config.agent.as_str();
        self.registry.get(agent).ok_or_else(|| {
            if self.config.agents.contains_key(agent) {
                ConfigError::RunnerNotRegistered(agent.to_string())
            } else {
                ConfigError::UnknownAgent(agent.to_string())
            }
        })
    }

    /// Check that `role` can be run, without running anything.
    pub fn check_role(&self, role: &str) -> Result<(), ConfigError> {
        self.resolve(role).map(|_| ())
    }

    /// Run one task through the agent bound to `role`.
    ///
    /// Only configuration problems are returned as `Err`. Runner failures are
    /// retried up to `max_retries` times and then reported as a failed result.
    pub async fn run_single(
        &self,
        role: &str,
        prompt: &str,
        task_id: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, ConfigError> {
        let runner = self.resolve(role)?;

        let role_prompt = self.prompts.get(role).map(String::as_str).unwrap_or("");
        let full_prompt = format!("{role_prompt}{PROMPT_SEPARATOR}{prompt}");
        let options = RunOptions::new();

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(task_id, role, runner.name(), attempt));
            }

            let start = Instant::now();
            let outcome = runner.run(&full_prompt, cwd, &options, cancel).await;
            let duration = start.elapsed();

            let result = match outcome {
                Ok(out) => TaskResult {
                    task_id: task_id.to_string(),
                    role: role.to_string(),
                    agent: runner.name().to_string(),
                    success: out.success,
                    output: out.output,
                    error: if out.success { String::new() } else { out.error },
                    duration,
                    retries: attempt,
                },
                Err(RunnerError::Cancelled { .. }) => {
                    return Ok(self.cancelled(task_id, role, runner.name(), attempt));
                }
                Err(e) => TaskResult {
                    task_id: task_id.to_string(),
                    role: role.to_string(),
                    agent: runner.name().to_string(),
                    success: false,
                    output: String::new(),
                    error: e.to_string(),
                    duration,
                    retries: attempt,
                },
            };

            if result.success {
                tracing::debug!(task_id, role, attempt, ?duration, "Task succeeded");
                return Ok(result);
            }

            if attempt >= self.max_retries {
                tracing::warn!(
                    task_id,
                    role,
                    attempts = attempt + 1,
                    error = %result.error,
                    "Task failed after exhausting retries"
                );
                return Ok(result);
            }

            tracing::info!(
                task_id,
                role,
                attempt,
                error = %result.error,
                "Task attempt failed, retrying in {:?}",
                self.retry_delay
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(self.cancelled(task_id, role, runner.name(), attempt));
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
            attempt += 1;
        }
    }

    /// Run a batch on `min(max_workers, tasks.len())` workers.
    ///
    /// The returned vector matches `tasks` index for index, whatever order
    /// the tasks finish in. A task whose id repeats an earlier one is not
    /// run; its slot holds a failed result.
    pub async fn run_parallel(
        &self,
        tasks: Vec<Task>,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        if tasks.is_empty() {
            return Vec::new();
        }

        let mut seen = HashSet::with_capacity(tasks.len());
        let first: Vec<bool> = tasks.iter().map(|t| seen.insert(t.id.as_str())).collect();
        let runnable: VecDeque<Task> = tasks
            .iter()
            .zip(&first)
            .filter(|(_, first)| **first)
            .map(|(task, _)| task.clone())
            .collect();
        if runnable.len() < tasks.len() {
            tracing::warn!(
                skipped = tasks.len() - runnable.len(),
                "Batch contains duplicate task ids"
            );
        }

        let workers = self.max_workers.min(runnable.len());
        tracing::info!(tasks = runnable.len(), workers, "Running task batch");

        let queue = Arc::new(Mutex::new(runnable));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<TaskResult>();

        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                let executor = self.clone();
                let queue = Arc::clone(&queue);
                let result_tx = result_tx.clone();
                let cwd: PathBuf = cwd.to_path_buf();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    loop {
                        let next = queue.lock().await.pop_front();
                        let Some(task) = next else { break };

                        let result = match executor
                            .run_single(&task.role, &task.prompt, &task.id, &cwd, &cancel)
                            .await
                        {
                            Ok(result) => result,
                            Err(e) => TaskResult::from_error(&task, e.to_string()),
                        };

                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                    tracing::debug!(worker_id, "Worker drained queue");
                })
            })
            .collect();
        drop(result_tx);

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!("Task worker panicked: {}", e);
            }
        }

        let mut by_id: HashMap<String, TaskResult> = HashMap::with_capacity(tasks.len());
        while let Some(result) = result_rx.recv().await {
            by_id.insert(result.task_id.clone(), result);
        }

        tasks
            .iter()
            .zip(first)
            .map(|(task, first)| {
                if !first {
                    let error = format!("duplicate task id: {}", task.id);
                    return TaskResult::from_error(task, error);
                }
                by_id
                    .remove(&task.id)
                    .unwrap_or_else(|| TaskResult::from_error(task, "result not found"))
            })
            .collect()
    }

    fn cancelled(&self, task_id: &str, role: &str, agent: &str, attempt: u32) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            role: role.to_string(),
            agent: agent.to_string(),
            success: false,
            output: String::new(),
            error: CANCELLED.to_string(),
            duration: Duration::ZERO,
            retries: attempt.min(self.max_retries),
        }
    }
}
