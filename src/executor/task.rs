//! Task and task-result types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A unit of work: run `prompt` under `role`.
///
/// This is also the batch input format for `brainchain parallel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub role: String,
    pub prompt: String,
}

impl Task {
    pub fn new(id: impl Into<String>, role: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            prompt: prompt.into(),
        }
    }
}

/// Outcome of running a [`Task`], produced after its final attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "id")]
    pub task_id: String,
    pub role: String,
    /// Runner implementation that handled the task.
    pub agent: String,
    pub success: bool,
    pub output: String,
    pub error: String,
    #[serde(with = "crate::util::duration_secs")]
    pub duration: Duration,
    /// Zero-based index of the attempt that produced this result.
    pub retries: u32,
}

impl TaskResult {
    /// A failed result that never reached a runner.
    pub fn from_error(task: &Task, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            role: task.role.clone(),
            agent: String::new(),
            success: false,
            output: String::new(),
            error: error.into(),
            duration: Duration::ZERO,
            retries: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_format_deserializes() {
        let json = r#"[{"id":"t1","role":"implementer","prompt":"do"}]"#;
        let tasks: Vec<Task> = serde_json::from_str(json).unwrap();
        assert_eq!(tasks, vec![Task::new("t1", "implementer", "do")]);
    }

    #[test]
    fn result_serializes_duration_as_seconds() {
        let mut result = TaskResult::from_error(&Task::new("t1", "r", "p"), "boom");
        result.duration = Duration::from_millis(1500);

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["id"], "t1");
        assert_eq!(value["duration"], 1.5);
        assert_eq!(value["error"], "boom");

        let back: TaskResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
    }
}
