use std::io;

use thiserror::Error;

/// Enumeration of errors returned by supervisor operations.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("service '{0}' not found")]
    NotFound(String),
    #[error("service '{0}' already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Validation(String),
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for {check}")]
    ReadinessTimeout { check: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("process exited unexpectedly ({0})")]
    UnexpectedExit(String),
    #[error("failed to stop '{name}': {reason}")]
    StopFailure { name: String, reason: String },
    #[error("failed to persist service definitions: {0}")]
    Persist(#[from] StoreError),
    #[error("log of '{name}' is unavailable: {source}")]
    Log {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    /// Short label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::AlreadyExists(_) => "already_exists",
            SupervisorError::Validation(_) => "validation",
            SupervisorError::SpawnFailure { .. } => "spawn_failure",
            SupervisorError::ReadinessTimeout { .. } => "readiness_timeout",
            SupervisorError::Cancelled => "cancelled",
            SupervisorError::UnexpectedExit(_) => "unexpected_exit",
            SupervisorError::StopFailure { .. } => "stop_failure",
            SupervisorError::Persist(_) => "persist",
            SupervisorError::Log { .. } => "log",
        }
    }
}

impl From<ProbeError> for SupervisorError {
    fn from(error: ProbeError) -> Self {
        match error {
            ProbeError::Timeout { check } => SupervisorError::ReadinessTimeout { check },
            ProbeError::Cancelled => SupervisorError::Cancelled,
        }
    }
}

/// Failure of a readiness wait; a timeout and an external cancellation are kept apart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("timed out waiting for {check}")]
    Timeout { check: String },
    #[error("readiness wait cancelled")]
    Cancelled,
}

/// Errors reading or writing the persisted definition file.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
