//! Version-tracked schema migrations.
//!
//! `run_migrations()` applies every migration newer than the highest version
//! recorded in `_migrations`. A database that already has a `sessions` table
//! but no version records was created before versioning: V1 DDL only creates
//! the tables it is missing, and V1 is then recorded as applied.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                status TEXT NOT NULL,
                workflow_name TEXT,
                initial_prompt TEXT NOT NULL,
                cwd TEXT NOT NULL,
                config_snapshot TEXT NOT NULL,
                name TEXT,
                auto_name TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                step_index INTEGER,
                task_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

            CREATE TABLE IF NOT EXISTS tool_invocations (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                tool_type TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                result TEXT,
                success INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tool_invocations_session ON tool_invocations(session_id);

            CREATE TABLE IF NOT EXISTS workflow_states (
                session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
                current_step INTEGER NOT NULL,
                step_results TEXT NOT NULL,
                plan TEXT,
                outputs TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "message_ordering_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_messages_session_timestamp
                ON messages(session_id, timestamp);
        "#,
    },
];

/// Enable foreign keys and bring the schema up to date.
pub async fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| migration_err("enable foreign keys", e))?;
    run_migrations(conn).await
}

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| migration_err("create version table", e))?;

    if get_current_version(conn).await? == 0 && unversioned_sessions_exist(conn).await? {
        let baseline = &MIGRATIONS[0];
        conn.execute_batch(baseline.sql)
            .await
            .map_err(|e| migration_err("complete unversioned schema", e))?;
        seed_version(conn, baseline.version, baseline.name).await?;
        tracing::info!("Found a sessions table without version records, marked V1 applied");
    }

    let applied = get_current_version(conn).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying schema migration"
        );
        conn.execute_batch(migration.sql).await.map_err(|e| {
            migration_err(&format!("apply V{} {}", migration.version, migration.name), e)
        })?;
        seed_version(conn, migration.version, migration.name).await?;
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Session schema up to date"
    );
    Ok(())
}

/// Highest applied migration version, or 0 if none.
pub async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    scalar(conn, "SELECT COALESCE(MAX(version), 0) FROM _migrations").await
}

async fn unversioned_sessions_exist(conn: &Connection) -> Result<bool, DatabaseError> {
    let count = scalar(
        conn,
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='sessions'",
    )
    .await?;
    Ok(count > 0)
}

/// First column of the first row as an integer; 0 when there is no row.
async fn scalar(conn: &Connection, sql: &str) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| migration_err("query schema state", e))?;
    match rows.next().await.map_err(|e| migration_err("read schema state", e))? {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| migration_err("decode schema state", e)),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| migration_err(&format!("record V{version}"), e))?;
    Ok(())
}

fn migration_err(action: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("could not {action}: {e}"))
}
