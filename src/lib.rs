//! brainchain: orchestration core for multi-CLI agent workflows.
//!
//! Roles map to external agent CLIs. The [`executor`] runs tasks with
//! retries and a bounded worker pool, the [`workflow`] engine drives
//! configured steps with jumps and plan fan-out, and the [`session`] layer
//! persists transcripts and checkpoints so interrupted runs can resume.

pub mod config;
pub mod error;
pub mod executor;
pub mod runner;
pub mod session;
pub mod store;
pub mod util;
pub mod workflow;
