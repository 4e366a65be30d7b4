//! Plan extraction from planning-step output.
//!
//! A plan is JSON, either bare or inside a fenced code block with prose
//! around it. Anything that doesn't parse is "no plan", never an error.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n?([\s\S]*?)\n?```").expect("valid fenced block regex")
});

/// The structured plan a planning role emits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub specs: Vec<PlanSpec>,
    /// Fields we don't interpret but hand on to later steps.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub content: String,
}

/// Accept ids written as strings or numbers.
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

impl Plan {
    /// Extract a plan from step output.
    ///
    /// The first fenced block wins when present; otherwise the whole text is
    /// tried. Only a JSON object counts as a plan.
    pub fn parse(text: &str) -> Option<Plan> {
        let candidate = FENCED_BLOCK
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or(text);

        let value: serde_json::Value = serde_json::from_str(candidate.trim()).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Plan as pretty JSON, for injection into later prompts.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Render one task, with every spec in the plan, as a prompt body.
    pub fn to_task_prompt(&self, task: &PlanTask) -> String {
        let mut lines = Vec::new();

        if !task.id.is_empty() {
            lines.push(format!("Task ID: {}", task.id));
        }
        if !task.description.is_empty() {
            lines.push(format!("Description: {}", task.description));
        }
        if !task.files.is_empty() {
            lines.push(format!("Files: {}", task.files.join(", ")));
        }
        if !task.acceptance_criteria.is_empty() {
            lines.push("Acceptance Criteria:".to_string());
            for criterion in &task.acceptance_criteria {
                lines.push(format!("  - {criterion}"));
            }
        }

        if !self.specs.is_empty() {
            lines.push("\nRelevant Specs:".to_string());
            for spec in &self.specs {
                lines.push(format!("--- {} ---\n{}", spec.file, spec.content));
            }
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Plan {
        Plan {
            tasks: vec![
                PlanTask {
                    id: "t1".into(),
                    description: "Add login form".into(),
                    files: vec!["src/login.rs".into()],
                    acceptance_criteria: vec!["renders".into(), "validates".into()],
                },
                PlanTask {
                    id: "t2".into(),
                    description: "Wire route".into(),
                    files: vec![],
                    acceptance_criteria: vec![],
                },
            ],
            specs: vec![PlanSpec {
                file: "docs/auth.md".into(),
                content: "Use sessions.".into(),
            }],
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn parses_bare_json() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert_eq!(Plan::parse(&json), Some(sample()));
    }

    #[test]
    fn parses_fenced_block_with_prose() {
        let json = serde_json::to_string_pretty(&sample()).unwrap();
        let text = format!("Here is the plan:\n\n```json\n{json}\n```\n\nLet me know.");
        assert_eq!(Plan::parse(&text), Some(sample()));
    }

    #[test]
    fn parses_unlabelled_fence() {
        let text = "```\n{\"tasks\": [{\"id\": 7, \"description\": \"x\"}]}\n```";
        let plan = Plan::parse(text).unwrap();
        assert_eq!(plan.tasks[0].id, "7");
        assert!(plan.specs.is_empty());
    }

    #[test]
    fn malformed_json_is_no_plan() {
        assert_eq!(Plan::parse("```json\n{\"tasks\": [\n```"), None);
        assert_eq!(Plan::parse("I could not come up with a plan."), None);
        assert_eq!(Plan::parse("[1, 2, 3]"), None);
    }

    #[test]
    fn unknown_fields_survive() {
        let plan = Plan::parse(r#"{"tasks": [], "summary": "small change"}"#).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.extra["summary"], "small change");
        assert!(plan.to_pretty_json().contains("small change"));
    }

    #[test]
    fn task_prompt_includes_task_and_specs() {
        let plan = sample();
        let prompt = plan.to_task_prompt(&plan.tasks[0]);
        assert!(prompt.starts_with("Task ID: t1\nDescription: Add login form"));
        assert!(prompt.contains("Files: src/login.rs"));
        assert!(prompt.contains("Acceptance Criteria:\n  - renders\n  - validates"));
        assert!(prompt.contains("--- docs/auth.md ---\nUse sessions."));
    }
}
