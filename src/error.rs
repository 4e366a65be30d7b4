//! Error types for brainchain.

/// Configuration-related errors. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("No runner registered for agent: {0}")]
    RunnerNotRegistered(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Transport-level failure of a single runner invocation.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn {command}: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Runner {name} was cancelled")]
    Cancelled { name: String },

    #[error("Runner {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors that stop a workflow before it can run.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("No workflow steps defined")]
    NoSteps,

    #[error("Checkpoint step {step} is out of range (workflow has {total} steps)")]
    CheckpointOutOfRange { step: usize, total: usize },
}
