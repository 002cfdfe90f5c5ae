//! Error types for the workflow runtime.

use std::path::PathBuf;
use thiserror::Error;

use crate::runtime::RunSummary;

/// Workflow-level error taxonomy.
///
/// Configuration-time errors (`UnbalancedGraph`, `NameConflict`,
/// `ResourceExhausted`, `InvalidEndpoint`, `InvalidConfig`) surface before any
/// child process is started. `StageFailures` is the aggregate raised after
/// join when one or more stages recorded an exception.
#[derive(Error, Debug)]
pub enum Error {
    #[error("fifo '{pipe}' is unbalanced (readers - writers = {balance})")]
    UnbalancedGraph { pipe: String, balance: i64 },

    #[error("fifo path already exists: {path}")]
    NameConflict { path: PathBuf },

    #[error("pipe buffer budget exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("invalid endpoint: {message}")]
    InvalidEndpoint { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{} stage(s) failed during workflow execution: {}", .0.failures.len(), .0.failed_stage_names().join(", "))]
    StageFailures(RunSummary),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convenience constructor used by the option validators.
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_endpoint(message: impl Into<String>) -> Self {
        Error::InvalidEndpoint {
            message: message.into(),
        }
    }
}
