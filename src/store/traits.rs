//! `SessionStore` trait and the records it persists.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
        }
    }

    /// Completed and failed sessions are eligible for retention cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "interrupted" => Ok(SessionStatus::Interrupted),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// One logical run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub workflow_name: Option<String>,
    pub initial_prompt: String,
    pub cwd: String,
    pub config_snapshot: serde_json::Value,
    /// User-assigned name.
    pub name: Option<String>,
    /// Name derived from the initial prompt.
    pub auto_name: Option<String>,
}

impl Session {
    /// User name, then auto name, then the short id.
    pub fn display_name(&self) -> &str {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name;
        }
        if let Some(name) = self.auto_name.as_deref().filter(|n| !n.is_empty()) {
            return name;
        }
        self.short_id()
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("unknown message role '{other}'")),
        }
    }
}

/// Transcript entry. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    pub step_index: Option<usize>,
    pub task_id: Option<String>,
}

/// Audit record of an auxiliary tool call. Never read back into control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub tool_type: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub success: bool,
    pub duration_ms: i64,
}

/// Resumability checkpoint. One per session, overwritten after every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    /// Index of the step the loop runs next.
    pub current_step: usize,
    #[serde(default)]
    pub step_results: Vec<serde_json::Value>,
    #[serde(default)]
    pub plan: Option<serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Durable session storage.
///
/// Implementations serialize their own writes; callers may share one store
/// across tasks.
#[async_trait]
pub trait SessionStore: Send + Sync {
    // ── Sessions ────────────────────────────────────────────────────

    async fn create_session(&self, session: &Session) -> Result<(), DatabaseError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, DatabaseError>;

    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), DatabaseError>;

    async fn update_session_name(
        &self,
        id: &str,
        name: Option<&str>,
        auto_name: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Most recently updated first.
    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<Session>, DatabaseError>;

    /// Sessions left `active` or `interrupted`.
    async fn get_interrupted_sessions(&self) -> Result<Vec<Session>, DatabaseError>;

    /// Delete a session and everything it owns. Returns whether it existed.
    async fn delete_session(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Delete completed / failed sessions not updated within `retention_days`.
    async fn cleanup_old_sessions(&self, retention_days: u32) -> Result<usize, DatabaseError>;

    // ── Transcript ──────────────────────────────────────────────────

    async fn add_message(&self, message: &Message) -> Result<(), DatabaseError>;

    /// Oldest first.
    async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>, DatabaseError>;

    async fn add_tool_invocation(&self, invocation: &ToolInvocation)
    -> Result<(), DatabaseError>;

    async fn get_tool_invocations(
        &self,
        session_id: &str,
    ) -> Result<Vec<ToolInvocation>, DatabaseError>;

    // ── Checkpoint ──────────────────────────────────────────────────

    /// Insert or replace the session's checkpoint.
    async fn save_workflow_state(&self, state: &WorkflowState) -> Result<(), DatabaseError>;

    async fn get_workflow_state(
        &self,
        session_id: &str,
    ) -> Result<Option<WorkflowState>, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Interrupted,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>(), Ok(status));
        }
        assert!("paused".parse::<SessionStatus>().is_err());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Interrupted.is_terminal());
    }

    #[test]
    fn display_name_falls_back_to_short_id() {
        let mut session = Session {
            id: "0123456789abcdef".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: SessionStatus::Active,
            workflow_name: None,
            initial_prompt: "p".into(),
            cwd: ".".into(),
            config_snapshot: serde_json::Value::Null,
            name: None,
            auto_name: Some("Add Login".into()),
        };
        assert_eq!(session.display_name(), "Add Login");

        session.name = Some("Mine".into());
        assert_eq!(session.display_name(), "Mine");

        session.name = None;
        session.auto_name = None;
        assert_eq!(session.display_name(), "01234567");
    }
}
