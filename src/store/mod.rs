//! Persistence layer: sessions, transcripts, tool audit log and workflow
//! checkpoints in a libSQL database.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    Message, MessageRole, Session, SessionStatus, SessionStore, ToolInvocation, WorkflowState,
};
