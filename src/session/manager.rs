//! Session manager: current-session bookkeeping over a [`SessionStore`].
//!
//! Calls that take `session_id: Option<&str>` fall back to the current
//! session. With neither, inserts are skipped and return `Ok(None)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::DatabaseError;
use crate::session::naming;
use crate::store::{
    LibSqlStore, Message, MessageRole, Session, SessionStatus, SessionStore, ToolInvocation,
    WorkflowState,
};

/// Everything stored for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session: Session,
    pub messages: Vec<Message>,
    pub tool_invocations: Vec<ToolInvocation>,
    pub workflow_state: Option<WorkflowState>,
}

/// Where a resumed session picks up.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub session: Session,
    pub workflow_state: Option<WorkflowState>,
    pub resume_from_step: usize,
}

impl ResumePoint {
    /// The stored checkpoint, or a fresh one at step 0 when the session
    /// stopped before its first step was recorded.
    pub fn checkpoint(&self) -> WorkflowState {
        self.workflow_state.clone().unwrap_or_else(|| WorkflowState {
            session_id: self.session.id.clone(),
            ..Default::default()
        })
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    current: RwLock<Option<String>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    /// Open the configured database file.
    pub async fn open(config: &SessionConfig) -> Result<Self, DatabaseError> {
        let store = LibSqlStore::new_local(&config.resolved_db_path()).await?;
        Ok(Self::new(Arc::new(store)))
    }

    /// In-memory store (for tests).
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::new(Arc::new(LibSqlStore::new_memory().await?)))
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn current_session_id(&self) -> Option<String> {
        self.current.read().await.clone()
    }

    async fn resolve(&self, session_id: Option<&str>) -> Option<String> {
        match session_id {
            Some(id) => Some(id.to_string()),
            None => self.current_session_id().await,
        }
    }

    async fn clear_current_if(&self, session_id: &str) {
        let mut current = self.current.write().await;
        if current.as_deref() == Some(session_id) {
            *current = None;
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create an active session and make it current.
    pub async fn create_session(
        &self,
        initial_prompt: &str,
        cwd: &str,
        workflow_name: Option<&str>,
        config_snapshot: serde_json::Value,
    ) -> Result<Session, DatabaseError> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            workflow_name: workflow_name.map(str::to_string),
            initial_prompt: initial_prompt.to_string(),
            cwd: cwd.to_string(),
            config_snapshot,
            name: None,
            auto_name: Some(naming::generate_name(initial_prompt, naming::DEFAULT_MAX_LEN)),
        };
        self.store.create_session(&session).await?;
        *self.current.write().await = Some(session.id.clone());

        info!(session_id = %session.id, name = session.display_name(), "Session started");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, DatabaseError> {
        self.store.get_session(session_id).await
    }

    pub async fn current_session(&self) -> Result<Option<Session>, DatabaseError> {
        match self.current_session_id().await {
            Some(id) => self.store.get_session(&id).await,
            None => Ok(None),
        }
    }

    /// Make an existing session current. Returns false if it doesn't exist.
    pub async fn set_current(&self, session_id: &str) -> Result<bool, DatabaseError> {
        if self.store.get_session(session_id).await?.is_none() {
            return Ok(false);
        }
        *self.current.write().await = Some(session_id.to_string());
        Ok(true)
    }

    pub async fn rename_session(&self, session_id: &str, name: &str) -> Result<(), DatabaseError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "session".into(),
                id: session_id.to_string(),
            })?;
        self.store
            .update_session_name(session_id, Some(name), session.auto_name.as_deref())
            .await
    }

    pub async fn complete_session(&self, session_id: Option<&str>) -> Result<(), DatabaseError> {
        let Some(sid) = self.resolve(session_id).await else {
            return Ok(());
        };
        self.store
            .update_session_status(&sid, SessionStatus::Completed)
            .await?;
        self.clear_current_if(&sid).await;
        Ok(())
    }

    /// Record the error in the transcript, then mark the session failed.
    pub async fn fail_session(
        &self,
        session_id: Option<&str>,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let Some(sid) = self.resolve(session_id).await else {
            return Ok(());
        };
        if !error.is_empty() {
            self.add_message(
                Some(&sid),
                MessageRole::System,
                &format!("Session failed: {error}"),
                None,
                None,
            )
            .await?;
        }
        self.store
            .update_session_status(&sid, SessionStatus::Failed)
            .await?;
        self.clear_current_if(&sid).await;
        Ok(())
    }

    /// Mark interrupted. The session stays current so it can be resumed.
    pub async fn interrupt_session(&self, session_id: Option<&str>) -> Result<(), DatabaseError> {
        let Some(sid) = self.resolve(session_id).await else {
            return Ok(());
        };
        self.store
            .update_session_status(&sid, SessionStatus::Interrupted)
            .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool, DatabaseError> {
        let deleted = self.store.delete_session(session_id).await?;
        self.clear_current_if(session_id).await;
        Ok(deleted)
    }

    pub async fn cleanup_old_sessions(&self, retention_days: u32) -> Result<usize, DatabaseError> {
        self.store.cleanup_old_sessions(retention_days).await
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<Session>, DatabaseError> {
        self.store.list_sessions(status, limit).await
    }

    pub async fn get_interrupted_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        self.store.get_interrupted_sessions().await
    }

    // ── Transcript ──────────────────────────────────────────────────

    pub async fn add_message(
        &self,
        session_id: Option<&str>,
        role: MessageRole,
        content: &str,
        step_index: Option<usize>,
        task_id: Option<&str>,
    ) -> Result<Option<Message>, DatabaseError> {
        let Some(sid) = self.resolve(session_id).await else {
            return Ok(None);
        };
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: sid,
            timestamp: Utc::now(),
            role,
            content: content.to_string(),
            step_index,
            task_id: task_id.map(str::to_string),
        };
        self.store.add_message(&message).await?;
        Ok(Some(message))
    }

    pub async fn get_messages(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<Message>, DatabaseError> {
        match self.resolve(session_id).await {
            Some(sid) => self.store.get_messages(&sid).await,
            None => Ok(Vec::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_tool_invocation(
        &self,
        session_id: Option<&str>,
        tool_type: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        result: Option<serde_json::Value>,
        success: bool,
        duration: Duration,
    ) -> Result<Option<ToolInvocation>, DatabaseError> {
        let Some(sid) = self.resolve(session_id).await else {
            return Ok(None);
        };
        let invocation = ToolInvocation {
            id: Uuid::new_v4().to_string(),
            session_id: sid,
            timestamp: Utc::now(),
            tool_type: tool_type.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            result,
            success,
            duration_ms: i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        };
        self.store.add_tool_invocation(&invocation).await?;
        Ok(Some(invocation))
    }

    pub async fn get_tool_invocations(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<ToolInvocation>, DatabaseError> {
        match self.resolve(session_id).await {
            Some(sid) => self.store.get_tool_invocations(&sid).await,
            None => Ok(Vec::new()),
        }
    }

    // ── Checkpoint ──────────────────────────────────────────────────

    pub async fn save_workflow_state(
        &self,
        session_id: Option<&str>,
        current_step: usize,
        step_results: Vec<serde_json::Value>,
        plan: Option<serde_json::Value>,
        outputs: BTreeMap<String, String>,
    ) -> Result<Option<WorkflowState>, DatabaseError> {
        let Some(sid) = self.resolve(session_id).await else {
            return Ok(None);
        };
        let state = WorkflowState {
            session_id: sid,
            current_step,
            step_results,
            plan,
            outputs,
        };
        self.store.save_workflow_state(&state).await?;
        Ok(Some(state))
    }

    pub async fn get_workflow_state(
        &self,
        session_id: Option<&str>,
    ) -> Result<Option<WorkflowState>, DatabaseError> {
        match self.resolve(session_id).await {
            Some(sid) => self.store.get_workflow_state(&sid).await,
            None => Ok(None),
        }
    }

    // ── Recovery ────────────────────────────────────────────────────

    pub async fn session_info(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionInfo>, DatabaseError> {
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        Ok(Some(SessionInfo {
            messages: self.store.get_messages(session_id).await?,
            tool_invocations: self.store.get_tool_invocations(session_id).await?,
            workflow_state: self.store.get_workflow_state(session_id).await?,
            session,
        }))
    }

    /// Reactivate a session, make it current, and report where it resumes.
    pub async fn prepare_resume(&self, session_id: &str) -> Result<ResumePoint, DatabaseError> {
        let mut session =
            self.store
                .get_session(session_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "session".into(),
                    id: session_id.to_string(),
                })?;
        let workflow_state = self.store.get_workflow_state(session_id).await?;

        self.store
            .update_session_status(session_id, SessionStatus::Active)
            .await?;
        session.status = SessionStatus::Active;
        *self.current.write().await = Some(session_id.to_string());

        let resume_from_step = workflow_state.as_ref().map_or(0, |s| s.current_step);
        debug!(session_id, resume_from_step, "Session prepared for resume");
        Ok(ResumePoint {
            session,
            workflow_state,
            resume_from_step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn manager() -> SessionManager {
        SessionManager::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_makes_session_current_and_names_it() {
        let mgr = manager().await;
        let session = mgr
            .create_session("fix the login bug", "/repo", Some("default"), json!({}))
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.auto_name.as_deref(), Some("Fix Login Bug"));
        assert_eq!(mgr.current_session_id().await, Some(session.id.clone()));
        assert_eq!(mgr.current_session().await.unwrap().unwrap().id, session.id);
    }

    #[tokio::test]
    async fn inserts_without_session_are_skipped() {
        let mgr = manager().await;
        let msg = mgr
            .add_message(None, MessageRole::User, "hi", None, None)
            .await
            .unwrap();
        assert!(msg.is_none());

        let state = mgr
            .save_workflow_state(None, 0, vec![], None, BTreeMap::new())
            .await
            .unwrap();
        assert!(state.is_none());
        mgr.complete_session(None).await.unwrap();
    }

    #[tokio::test]
    async fn messages_default_to_current_session() {
        let mgr = manager().await;
        let session = mgr.create_session("p", ".", None, json!({})).await.unwrap();

        mgr.add_message(None, MessageRole::User, "hello", Some(0), None)
            .await
            .unwrap();
        let messages = mgr.get_messages(Some(&session.id)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].session_id, session.id);
        assert_eq!(messages[0].step_index, Some(0));
    }

    #[tokio::test]
    async fn fail_records_reason_then_clears_current() {
        let mgr = manager().await;
        let session = mgr.create_session("p", ".", None, json!({})).await.unwrap();

        mgr.fail_session(None, "step 2 (reviewer) failed: boom")
            .await
            .unwrap();

        let stored = mgr.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert!(mgr.current_session_id().await.is_none());

        let messages = mgr.get_messages(Some(&session.id)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[0].content, "Session failed: step 2 (reviewer) failed: boom");
    }

    #[tokio::test]
    async fn complete_clears_current_but_interrupt_keeps_it() {
        let mgr = manager().await;
        let session = mgr.create_session("p", ".", None, json!({})).await.unwrap();

        mgr.interrupt_session(None).await.unwrap();
        assert_eq!(mgr.current_session_id().await, Some(session.id.clone()));
        let interrupted = mgr.get_interrupted_sessions().await.unwrap();
        assert_eq!(interrupted.len(), 1);

        mgr.complete_session(None).await.unwrap();
        assert!(mgr.current_session_id().await.is_none());
        assert!(mgr.get_interrupted_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_current_requires_existing_session() {
        let mgr = manager().await;
        assert!(!mgr.set_current("ghost").await.unwrap());

        let session = mgr.create_session("p", ".", None, json!({})).await.unwrap();
        mgr.complete_session(None).await.unwrap();
        assert!(mgr.set_current(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn tool_invocations_record_duration_in_millis() {
        let mgr = manager().await;
        mgr.create_session("p", ".", None, json!({})).await.unwrap();

        let inv = mgr
            .record_tool_invocation(
                None,
                "cli",
                "claude",
                json!({"role": "planner"}),
                Some(json!({"success": true})),
                true,
                Duration::from_millis(2500),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inv.duration_ms, 2500);

        let stored = mgr.get_tool_invocations(None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].tool_name, "claude");
    }

    #[tokio::test]
    async fn prepare_resume_reactivates_and_reports_step() {
        let mgr = manager().await;
        let session = mgr
            .create_session("build it", "/repo", None, json!({}))
            .await
            .unwrap();
        mgr.save_workflow_state(
            None,
            2,
            vec![json!({"role": "planner"}), json!({"role": "validator"})],
            Some(json!({"tasks": []})),
            BTreeMap::from([("plan.json".to_string(), "{}".to_string())]),
        )
        .await
        .unwrap();
        mgr.interrupt_session(None).await.unwrap();

        let other = SessionManager::new(Arc::clone(mgr.store()));
        let point = other.prepare_resume(&session.id).await.unwrap();

        assert_eq!(point.resume_from_step, 2);
        assert_eq!(point.session.status, SessionStatus::Active);
        assert_eq!(point.session.initial_prompt, "build it");
        assert_eq!(point.workflow_state.unwrap().outputs["plan.json"], "{}");
        assert_eq!(other.current_session_id().await, Some(session.id.clone()));

        let stored = other.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn resume_without_checkpoint_starts_at_first_step() {
        let mgr = manager().await;
        let session = mgr
            .create_session("build it", "/repo", None, json!({}))
            .await
            .unwrap();
        mgr.interrupt_session(None).await.unwrap();

        let point = mgr.prepare_resume(&session.id).await.unwrap();
        assert!(point.workflow_state.is_none());
        assert_eq!(point.resume_from_step, 0);

        let checkpoint = point.checkpoint();
        assert_eq!(checkpoint.session_id, session.id);
        assert_eq!(checkpoint.current_step, 0);
        assert!(checkpoint.plan.is_none());
        assert!(checkpoint.outputs.is_empty());
        assert!(checkpoint.step_results.is_empty());
    }

    #[tokio::test]
    async fn prepare_resume_of_unknown_session_is_not_found() {
        let mgr = manager().await;
        let err = mgr.prepare_resume("ghost").await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn session_info_bundles_everything() {
        let mgr = manager().await;
        let session = mgr.create_session("p", ".", None, json!({})).await.unwrap();
        mgr.add_message(None, MessageRole::User, "p", None, None)
            .await
            .unwrap();

        let info = mgr.session_info(&session.id).await.unwrap().unwrap();
        assert_eq!(info.session.id, session.id);
        assert_eq!(info.messages.len(), 1);
        assert!(info.tool_invocations.is_empty());
        assert!(info.workflow_state.is_none());

        assert!(mgr.session_info("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_clears_current() {
        let mgr = manager().await;
        let session = mgr.create_session("p", ".", None, json!({})).await.unwrap();
        assert!(mgr.delete_session(&session.id).await.unwrap());
        assert!(mgr.current_session_id().await.is_none());
    }
}
