//! Error types for the fleetwatch core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering transcripts, model invocation, the persistent store,
//! configuration, and the summary engine itself.

use std::path::PathBuf;

/// Top-level error type for the fleetwatch core library.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Summary error: {0}")]
    Summary(#[from] SummaryError),

    #[error("Transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from locating and reading session transcripts.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("No transcript found for project '{project_key}', session '{session_id}'")]
    NotFound {
        project_key: String,
        session_id: String,
    },

    #[error("No active session found for project '{project_key}'")]
    NoActiveSession { project_key: String },

    #[error("Invalid session id: '{session_id}'")]
    InvalidSessionId { session_id: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the external summarization model call.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Failed to start model process: {message}")]
    Spawn { message: String },

    #[error("Model call failed: {message}")]
    Failed { message: String },

    #[error("Model response parse error: {message}")]
    ResponseParse { message: String },
}

/// Errors from the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Store task failed: {message}")]
    Task { message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Database {
                message: other.to_string(),
            },
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors surfaced by the summary cache-and-refresh engine.
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("Summary service is disabled")]
    ServiceDisabled,

    #[error("Transcript unavailable: {0}")]
    TranscriptUnavailable(#[from] TranscriptError),

    #[error("Model invocation failed: {0}")]
    ModelInvocationFailed(#[from] ModelError),

    #[error("Failed to persist summary: {0}")]
    PersistenceFailed(#[source] StoreError),

    #[error("Summary store query failed: {0}")]
    StoreQueryFailed(#[source] StoreError),

    #[error("A refresh is already in progress for agent '{agent_id}'")]
    RefreshInProgress { agent_id: String },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Agent '{agent_id}' has no project key")]
    MissingProjectKey { agent_id: String },

    #[error("Summary service is shutting down")]
    ShuttingDown,
}

impl SummaryError {
    /// Whether this error means "no summary yet" rather than a system failure.
    pub fn is_data_unavailable(&self) -> bool {
        matches!(
            self,
            SummaryError::TranscriptUnavailable(
                TranscriptError::NotFound { .. }
                    | TranscriptError::NoActiveSession { .. }
                    | TranscriptError::InvalidSessionId { .. }
            ) | SummaryError::MissingProjectKey { .. }
        )
    }
}

/// A type alias for results using the top-level `FleetError`.
pub type Result<T> = std::result::Result<T, FleetError>;
