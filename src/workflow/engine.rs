//! Step loop: prompt building, fan-out, gates, jumps, loop guard and
//! checkpoints.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, GOTO_PREFIX, StepConfig};
use crate::error::WorkflowError;
use crate::executor::{Executor, Task, TaskResult};
use crate::session::SessionManager;
use crate::store::{MessageRole, WorkflowState};
use crate::workflow::plan::Plan;
use crate::workflow::verdict::check_verdict;

/// Output slot seeded with the user request.
pub const INITIAL_PROMPT_KEY: &str = "initial_prompt";

/// Output slot preferred as the run's final output.
pub const FINAL_OUTPUT_KEY: &str = "final";

/// Outcome of one visit to a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub role: String,
    pub success: bool,
    #[serde(with = "crate::util::duration_secs")]
    pub duration: Duration,
    pub output: String,
    pub error: String,
    #[serde(default)]
    pub task_results: Vec<TaskResult>,
    /// Directive the engine picked after the step ran.
    #[serde(default)]
    pub jump_target: Option<String>,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub step_results: Vec<StepResult>,
    #[serde(with = "crate::util::duration_secs")]
    pub total_duration: Duration,
    pub final_output: String,
    pub error: String,
}

/// Static description of the workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowInfo {
    pub name: Option<String>,
    pub total_steps: usize,
    pub max_loops: usize,
    pub steps: Vec<StepInfo>,
    pub available_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    /// 1-based.
    pub index: usize,
    pub role: String,
    pub input: Option<String>,
    pub output: Option<String>,
    pub per_task: bool,
    pub gate: bool,
    pub on_fail: Option<String>,
    pub on_success: Option<String>,
}

/// Mutable state owned by a single run.
#[derive(Default)]
struct RunState {
    plan: Option<Plan>,
    outputs: BTreeMap<String, String>,
    results: Vec<StepResult>,
    visits: HashMap<usize, usize>,
}

/// Drives the configured steps through the executor.
pub struct Engine {
    config: Arc<Config>,
    executor: Executor,
    session: Option<Arc<SessionManager>>,
    steps: Vec<StepConfig>,
    /// First step index for each role.
    role_steps: HashMap<String, usize>,
    max_loops: usize,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        executor: Executor,
        session: Option<Arc<SessionManager>>,
    ) -> Self {
        let steps = config.workflow.steps.clone();
        let mut role_steps = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            role_steps.entry(step.role.clone()).or_insert(i);
        }
        let max_loops = config.workflow.max_loops.max(1);

        Self {
            config,
            executor,
            session,
            steps,
            role_steps,
            max_loops,
        }
    }

    pub fn with_max_loops(mut self, max_loops: usize) -> Self {
        self.max_loops = max_loops.max(1);
        self
    }

    pub fn steps(&self) -> &[StepConfig] {
        &self.steps
    }

    pub fn info(&self) -> WorkflowInfo {
        WorkflowInfo {
            name: self.config.workflow.name.clone(),
            total_steps: self.steps.len(),
            max_loops: self.max_loops,
            steps: self
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| StepInfo {
                    index: i + 1,
                    role: s.role.clone(),
                    input: s.input.clone(),
                    output: s.output.clone(),
                    per_task: s.per_task,
                    gate: s.is_gate(),
                    on_fail: s.on_fail.clone(),
                    on_success: s.on_success.clone(),
                })
                .collect(),
            available_roles: self.config.roles.keys().cloned().collect(),
        }
    }

    /// Run from the first step.
    pub async fn run(
        &self,
        initial_prompt: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> WorkflowResult {
        let mut state = RunState::default();
        state
            .outputs
            .insert(INITIAL_PROMPT_KEY.to_string(), initial_prompt.to_string());

        if let Some(session) = &self.session
            && let Err(e) = session
                .add_message(None, MessageRole::User, initial_prompt, None, None)
                .await
        {
            warn!("Failed to record initial prompt: {e}");
        }

        self.drive(state, 0, initial_prompt, cwd, cancel).await
    }

    /// Continue from a checkpoint: step index, plan, outputs and prior step
    /// results are restored and nothing before `current_step` is re-run.
    pub async fn resume(
        &self,
        checkpoint: WorkflowState,
        initial_prompt: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::NoSteps);
        }
        if checkpoint.current_step > self.steps.len() {
            return Err(WorkflowError::CheckpointOutOfRange {
                step: checkpoint.current_step,
                total: self.steps.len(),
            });
        }

        let plan = checkpoint
            .plan
            .and_then(|value| serde_json::from_value::<Plan>(value).ok());
        let results = checkpoint
            .step_results
            .into_iter()
            .filter_map(|value| serde_json::from_value::<StepResult>(value).ok())
            .collect();
        let mut outputs = checkpoint.outputs;
        outputs
            .entry(INITIAL_PROMPT_KEY.to_string())
            .or_insert_with(|| initial_prompt.to_string());

        info!(
            resume_from = checkpoint.current_step + 1,
            total = self.steps.len(),
            has_plan = plan.is_some(),
            "Resuming workflow"
        );

        let state = RunState {
            plan,
            outputs,
            results,
            visits: HashMap::new(),
        };
        Ok(self
            .drive(state, checkpoint.current_step, initial_prompt, cwd, cancel)
            .await)
    }

    async fn drive(
        &self,
        mut state: RunState,
        start_step: usize,
        initial_prompt: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> WorkflowResult {
        let start = Instant::now();

        if self.steps.is_empty() {
            return self.finish(state, start, Err(WorkflowError::NoSteps.to_string()));
        }
        if let Some(e) = self
            .steps
            .iter()
            .find_map(|s| self.executor.check_role(&s.role).err())
        {
            return self.finish(state, start, Err(format!("Configuration error: {e}")));
        }

        let mut current = start_step;
        while current < self.steps.len() {
            if cancel.is_cancelled() {
                return self.finish(state, start, Err("workflow cancelled".to_string()));
            }

            let visits = state.visits.entry(current).or_insert(0);
            *visits += 1;
            if *visits > self.max_loops {
                warn!(step = current + 1, max_loops = self.max_loops, "Loop guard tripped");
                let msg = format!(
                    "max loops ({}) exceeded at step {}",
                    self.max_loops,
                    current + 1
                );
                return self.finish(state, start, Err(msg));
            }

            let step = &self.steps[current];
            info!(
                step = current + 1,
                total = self.steps.len(),
                role = %step.role,
                per_task = step.per_task,
                "Running step"
            );

            let mut result = match self
                .execute_step(current, step, initial_prompt, cwd, cancel, &mut state)
                .await
            {
                Ok(result) => result,
                Err(msg) => {
                    self.checkpoint(current, &state).await;
                    return self.finish(state, start, Err(msg));
                }
            };

            let directive = if result.success {
                step.on_success.clone()
            } else {
                step.on_fail.clone()
            };
            let jump = directive.as_deref().and_then(|d| self.resolve_jump(d));
            result.jump_target = directive;

            let interrupted = cancel.is_cancelled();
            let next = match jump {
                // A step cut short by cancellation is retried on resume.
                _ if interrupted && !result.success => current,
                Some(target) => target,
                None if result.success => current + 1,
                None => current,
            };

            let failure = (!result.success && jump.is_none()).then(|| {
                format!(
                    "step {} ({}) failed: {}",
                    current + 1,
                    step.role,
                    result.error
                )
            });
            if let Some(target) = jump
                && !interrupted
            {
                info!(
                    from = current + 1,
                    to = target + 1,
                    success = result.success,
                    "Jumping to step"
                );
            }

            state.results.push(result);
            self.checkpoint(next, &state).await;

            if interrupted {
                return self.finish(state, start, Err("workflow cancelled".to_string()));
            }
            if let Some(msg) = failure {
                return self.finish(state, start, Err(msg));
            }
            current = next;
        }

        self.finish(state, start, Ok(()))
    }

    /// Run one step. `Err` is a configuration problem that ends the run.
    async fn execute_step(
        &self,
        idx: usize,
        step: &StepConfig,
        initial_prompt: &str,
        cwd: &Path,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<StepResult, String> {
        let start = Instant::now();

        let mut result = if step.per_task {
            self.execute_per_task(idx, step, cwd, cancel, state).await
        } else {
            self.execute_single(idx, step, initial_prompt, cwd, cancel, state)
                .await?
        };
        result.duration = start.elapsed();

        if result.success
            && let Some(name) = &step.output
        {
            state.outputs.insert(name.clone(), result.output.clone());
            if *name == self.config.workflow.plan_output {
                match Plan::parse(&result.output) {
                    Some(plan) => {
                        info!(tasks = plan.tasks.len(), "Plan extracted");
                        state.plan = Some(plan);
                    }
                    None => debug!(step = idx + 1, "No plan extracted from step output"),
                }
            }
        }

        Ok(result)
    }

    async fn execute_single(
        &self,
        idx: usize,
        step: &StepConfig,
        initial_prompt: &str,
        cwd: &Path,
        cancel: &CancellationToken,
        state: &RunState,
    ) -> Result<StepResult, String> {
        let prompt = self.build_prompt(idx, step, initial_prompt, state);
        let task_id = format!("step{}", idx + 1);

        let task_result = self
            .executor
            .run_single(&step.role, &prompt, &task_id, cwd, cancel)
            .await
            .map_err(|e| {
                format!(
                    "step {} ({}) failed: Configuration error: {e}",
                    idx + 1,
                    step.role
                )
            })?;
        self.record_task(idx, &task_result, false).await;

        let mut success = task_result.success;
        let mut error = task_result.error.clone();
        if success && step.is_gate() && !check_verdict(&task_result.output) {
            info!(step = idx + 1, role = %step.role, "Gate rejected");
            success = false;
            error = format!("{} verdict did not approve", step.role);
        }

        Ok(StepResult {
            step_index: idx,
            role: step.role.clone(),
            success,
            output: task_result.output.clone(),
            error,
            task_results: vec![task_result],
            ..Default::default()
        })
    }

    async fn execute_per_task(
        &self,
        idx: usize,
        step: &StepConfig,
        cwd: &Path,
        cancel: &CancellationToken,
        state: &RunState,
    ) -> StepResult {
        let failed = |error: String| StepResult {
            step_index: idx,
            role: step.role.clone(),
            success: false,
            error,
            ..Default::default()
        };

        let Some(plan) = state.plan.as_ref() else {
            return failed(format!(
                "no plan available for per-task step {} ({})",
                idx + 1,
                step.role
            ));
        };
        if plan.is_empty() {
            return failed("plan contains no tasks".to_string());
        }

        let mut seen = HashSet::new();
        let tasks: Vec<Task> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let mut id = if entry.id.is_empty() {
                    format!("task{}", i + 1)
                } else {
                    entry.id.clone()
                };
                if !seen.insert(id.clone()) {
                    id = format!("{id}-{}", i + 1);
                    seen.insert(id.clone());
                }
                Task::new(id, step.role.clone(), plan.to_task_prompt(entry))
            })
            .collect();

        let results = self.executor.run_parallel(tasks, cwd, cancel).await;
        for task_result in &results {
            self.record_task(idx, task_result, true).await;
        }

        let success = results.iter().all(|r| r.success);
        let output = results
            .iter()
            .filter(|r| !r.output.is_empty())
            .map(|r| r.output.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        let error = results
            .iter()
            .filter(|r| !r.success && !r.error.is_empty())
            .map(|r| format!("{}: {}", r.task_id, r.error))
            .collect::<Vec<_>>()
            .join("; ");

        StepResult {
            step_index: idx,
            role: step.role.clone(),
            success,
            output,
            error,
            task_results: results,
            ..Default::default()
        }
    }

    fn is_planning(&self, idx: usize, step: &StepConfig) -> bool {
        idx == 0 || step.role == self.config.workflow.planner_role
    }

    fn build_prompt(
        &self,
        idx: usize,
        step: &StepConfig,
        initial_prompt: &str,
        state: &RunState,
    ) -> String {
        let planning = self.is_planning(idx, step);
        let mut parts = Vec::new();

        if planning {
            parts.push(format!("User Request:\n{initial_prompt}"));
        }
        if let Some(input) = &step.input
            && let Some(content) = state.outputs.get(input)
        {
            parts.push(format!("Input ({input}):\n{content}"));
        }
        if let Some(plan) = &state.plan
            && !planning
        {
            parts.push(format!(
                "Current Plan:\n```json\n{}\n```",
                plan.to_pretty_json()
            ));
        }

        if parts.is_empty() {
            initial_prompt.to_string()
        } else {
            parts.join("\n\n")
        }
    }

    fn resolve_jump(&self, directive: &str) -> Option<usize> {
        let role = directive.strip_prefix(GOTO_PREFIX)?;
        let target = self.role_steps.get(role).copied();
        if target.is_none() {
            warn!(directive, "Jump target does not match any step, ignoring");
        }
        target
    }

    /// Persist the checkpoint. `next_step` is where the loop continues.
    async fn checkpoint(&self, next_step: usize, state: &RunState) {
        let Some(session) = &self.session else {
            return;
        };

        let step_results = state
            .results
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        let plan = state
            .plan
            .as_ref()
            .and_then(|p| serde_json::to_value(p).ok());

        if let Err(e) = session
            .save_workflow_state(None, next_step, step_results, plan, state.outputs.clone())
            .await
        {
            error!(next_step, "Failed to save workflow checkpoint: {e}");
        }
    }

    /// Transcript message and audit record for one finished task.
    async fn record_task(&self, idx: usize, result: &TaskResult, fanned_out: bool) {
        let Some(session) = &self.session else {
            return;
        };

        let content = if result.success {
            result.output.as_str()
        } else {
            result.error.as_str()
        };
        let task_id = fanned_out.then_some(result.task_id.as_str());
        if let Err(e) = session
            .add_message(None, MessageRole::Assistant, content, Some(idx), task_id)
            .await
        {
            warn!("Failed to record step output: {e}");
        }

        let arguments = serde_json::json!({
            "role": result.role,
            "task_id": result.task_id,
            "step": idx + 1,
        });
        let outcome = serde_json::json!({
            "success": result.success,
            "error": result.error,
            "retries": result.retries,
        });
        if let Err(e) = session
            .record_tool_invocation(
                None,
                "cli",
                &result.agent,
                arguments,
                Some(outcome),
                result.success,
                result.duration,
            )
            .await
        {
            warn!("Failed to record tool invocation: {e}");
        }
    }

    fn finish(
        &self,
        state: RunState,
        start: Instant,
        outcome: Result<(), String>,
    ) -> WorkflowResult {
        let final_output = state
            .outputs
            .get(FINAL_OUTPUT_KEY)
            .cloned()
            .or_else(|| state.results.last().map(|r| r.output.clone()))
            .unwrap_or_default();

        let (success, error) = match outcome {
            Ok(()) => (true, String::new()),
            Err(e) => (false, e),
        };
        if success {
            info!(steps = state.results.len(), "Workflow completed");
        } else {
            warn!(error = %error, "Workflow failed");
        }

        WorkflowResult {
            success,
            steps_completed: state.results.len(),
            total_steps: self.steps.len(),
            step_results: state.results,
            total_duration: start.elapsed(),
            final_output: if success { final_output } else { String::new() },
            error,
        }
    }
}
