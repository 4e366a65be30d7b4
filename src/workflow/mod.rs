//! Workflow engine.
//!
//! Steps run strictly in sequence. A step either runs its role once or, with
//! `per_task`, fans out over every task of the current plan. After each step
//! the engine checkpoints, then follows `on_fail` / `on_success` jumps or
//! moves on. Visits per step are capped by `max_loops`.

pub mod engine;
pub mod plan;
pub mod verdict;

pub use engine::{Engine, StepInfo, StepResult, WorkflowInfo, WorkflowResult};
pub use plan::{Plan, PlanSpec, PlanTask};
pub use verdict::check_verdict;
