//! libSQL backend for [`SessionStore`].
//!
//! One connection, local file or in-memory. Writes go through an async mutex
//! so concurrent callers never interleave a mutation with its `updated_at`
//! refresh.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Message, MessageRole, Session, SessionStatus, SessionStore, ToolInvocation, WorkflowState,
};

pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Session database opened");
        Ok(store)
    }

    /// In-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::init_schema(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn touch(&self, session_id: &str, now: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now, session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch session: {e}")))?;
        Ok(())
    }

    async fn query_sessions(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut sessions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_session(&row) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!("Skipping session row: {e}"),
            }
        }
        Ok(sessions)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so string order is time order.
fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    format_ts(&Utc::now())
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const SESSION_COLUMNS: &str = "id, created_at, updated_at, status, workflow_name, \
     initial_prompt, cwd, config_snapshot, name, auto_name";

/// Column order matches `SESSION_COLUMNS`.
fn row_to_session(row: &libsql::Row) -> Result<Session, libsql::Error> {
    let status_str: String = row.get(3)?;
    let snapshot: String = row.get::<String>(7).unwrap_or_default();

    Ok(Session {
        id: row.get(0)?,
        created_at: parse_datetime(&row.get::<String>(1)?),
        updated_at: parse_datetime(&row.get::<String>(2)?),
        status: status_str.parse().unwrap_or(SessionStatus::Interrupted),
        workflow_name: row.get::<String>(4).ok(),
        initial_prompt: row.get(5)?,
        cwd: row.get(6)?,
        config_snapshot: serde_json::from_str(&snapshot).unwrap_or(serde_json::Value::Null),
        name: row.get::<String>(8).ok(),
        auto_name: row.get::<String>(9).ok(),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let role: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        timestamp: parse_datetime(&row.get::<String>(2)?),
        role: role.parse().unwrap_or(MessageRole::System),
        content: row.get(4)?,
        step_index: row.get::<i64>(5).ok().map(|i| i.max(0) as usize),
        task_id: row.get::<String>(6).ok(),
    })
}

fn row_to_tool_invocation(row: &libsql::Row) -> Result<ToolInvocation, libsql::Error> {
    let arguments: String = row.get(5)?;
    let result: Option<String> = row.get::<String>(6).ok();
    Ok(ToolInvocation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        timestamp: parse_datetime(&row.get::<String>(2)?),
        tool_type: row.get(3)?,
        tool_name: row.get(4)?,
        arguments: serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        success: row.get::<i64>(7)? != 0,
        duration_ms: row.get(8)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlStore {
    async fn create_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let snapshot = to_json(&session.config_snapshot)?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO sessions ({SESSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    session.id.as_str(),
                    format_ts(&session.created_at),
                    format_ts(&session.updated_at),
                    session.status.as_str(),
                    opt_text(session.workflow_name.as_deref()),
                    session.initial_prompt.as_str(),
                    session.cwd.as_str(),
                    snapshot,
                    opt_text(session.name.as_deref()),
                    opt_text(session.auto_name.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_session: {e}")))?;

        debug!(session_id = %session.id, "Session created");
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, DatabaseError> {
        let mut sessions = self
            .query_sessions(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                "get_session",
            )
            .await?;
        Ok(sessions.pop())
    }

    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_ts(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_session_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session".into(),
                id: id.to_string(),
            });
        }
        debug!(session_id = id, status = %status, "Session status updated");
        Ok(())
    }

    async fn update_session_name(
        &self,
        id: &str,
        name: Option<&str>,
        auto_name: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE sessions SET name = ?1, auto_name = ?2, updated_at = ?3 WHERE id = ?4",
                params![opt_text(name), opt_text(auto_name), now_ts(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_session_name: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<Session>, DatabaseError> {
        let limit = limit as i64;
        match status {
            Some(status) => {
                self.query_sessions(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1
                         ORDER BY updated_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit],
                    "list_sessions",
                )
                .await
            }
            None => {
                self.query_sessions(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC LIMIT ?1"
                    ),
                    params![limit],
                    "list_sessions",
                )
                .await
            }
        }
    }

    async fn get_interrupted_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE status IN ('active', 'interrupted')
                 ORDER BY updated_at DESC"
            ),
            (),
            "get_interrupted_sessions",
        )
        .await
    }

    async fn delete_session(&self, id: &str) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let deleted = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_session: {e}")))?;
        Ok(deleted > 0)
    }

    async fn cleanup_old_sessions(&self, retention_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let _guard = self.write_lock.lock().await;
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM sessions WHERE updated_at < ?1 AND status IN ('completed', 'failed')",
                params![format_ts(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup_old_sessions: {e}")))?;

        if deleted > 0 {
            info!(count = deleted, retention_days, "Cleaned up old sessions");
        }
        Ok(deleted as usize)
    }

    async fn add_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let step_index = match message.step_index {
            Some(i) => libsql::Value::Integer(i as i64),
            None => libsql::Value::Null,
        };
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO messages (id, session_id, timestamp, role, content, step_index, task_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id.as_str(),
                    message.session_id.as_str(),
                    format_ts(&message.timestamp),
                    message.role.as_str(),
                    message.content.as_str(),
                    step_index,
                    opt_text(message.task_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_message: {e}")))?;
        self.touch(&message.session_id, &now_ts()).await
    }

    async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, session_id, timestamp, role, content, step_index, task_id
                 FROM messages WHERE session_id = ?1 ORDER BY timestamp ASC, rowid ASC",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn add_tool_invocation(
        &self,
        invocation: &ToolInvocation,
    ) -> Result<(), DatabaseError> {
        let arguments = to_json(&invocation.arguments)?;
        let result = match &invocation.result {
            Some(r) => libsql::Value::Text(to_json(r)?),
            None => libsql::Value::Null,
        };
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO tool_invocations (id, session_id, timestamp, tool_type, tool_name,
                    arguments, result, success, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    invocation.id.as_str(),
                    invocation.session_id.as_str(),
                    format_ts(&invocation.timestamp),
                    invocation.tool_type.as_str(),
                    invocation.tool_name.as_str(),
                    arguments,
                    result,
                    i64::from(invocation.success),
                    invocation.duration_ms,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_tool_invocation: {e}")))?;
        self.touch(&invocation.session_id, &now_ts()).await
    }

    async fn get_tool_invocations(
        &self,
        session_id: &str,
    ) -> Result<Vec<ToolInvocation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, session_id, timestamp, tool_type, tool_name, arguments, result,
                    success, duration_ms
                 FROM tool_invocations WHERE session_id = ?1 ORDER BY timestamp ASC, rowid ASC",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tool_invocations: {e}")))?;

        let mut invocations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_tool_invocation(&row) {
                Ok(inv) => invocations.push(inv),
                Err(e) => tracing::warn!("Skipping tool invocation row: {e}"),
            }
        }
        Ok(invocations)
    }

    async fn save_workflow_state(&self, state: &WorkflowState) -> Result<(), DatabaseError> {
        let step_results = to_json(&state.step_results)?;
        let outputs = to_json(&state.outputs)?;
        let plan = match &state.plan {
            Some(p) => libsql::Value::Text(to_json(p)?),
            None => libsql::Value::Null,
        };
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO workflow_states
                    (session_id, current_step, step_results, plan, outputs)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    state.session_id.as_str(),
                    state.current_step as i64,
                    step_results,
                    plan,
                    outputs,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_workflow_state: {e}")))?;
        self.touch(&state.session_id, &now_ts()).await?;

        debug!(
            session_id = %state.session_id,
            current_step = state.current_step,
            "Workflow checkpoint saved"
        );
        Ok(())
    }

    async fn get_workflow_state(
        &self,
        session_id: &str,
    ) -> Result<Option<WorkflowState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT session_id, current_step, step_results, plan, outputs
                 FROM workflow_states WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workflow_state: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workflow_state: {e}")))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let read = |e: libsql::Error| DatabaseError::Query(format!("get_workflow_state: {e}"));
        let step_results: String = row.get(2).map_err(read)?;
        let plan: Option<String> = row.get::<String>(3).ok();
        let outputs: String = row.get(4).map_err(read)?;

        Ok(Some(WorkflowState {
            session_id: row.get(0).map_err(read)?,
            current_step: row.get::<i64>(1).map_err(read)?.max(0) as usize,
            step_results: serde_json::from_str(&step_results)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            plan: plan.and_then(|p| serde_json::from_str(&p).ok()),
            outputs: serde_json::from_str::<BTreeMap<String, String>>(&outputs)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        }))
    }
}
