//! Session lifecycle on top of the store: current session, status
//! transitions, resume points and naming.

pub mod manager;
pub mod naming;

pub use manager::{ResumePoint, SessionInfo, SessionManager};
