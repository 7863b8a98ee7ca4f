//! Typed error hierarchy for the deployment orchestrator.
//!
//! Four enums cover the four seams:
//! - `StoreError` — event log, lifecycle and service log stores
//! - `RunnerError` — the external workload runner
//! - `TranslateError` — a single malformed native event
//! - `OrchestratorError` — run/session/stop operations exposed to callers

use thiserror::Error;

/// Errors from the durable stores (event log, lifecycle, service logs).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Deployment {name} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Deployment {0} not found")]
    NotFound(String),

    #[error("Deployment {0} already exists")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Failed to encode stored value: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Errors from the workload runner collaborator.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to create sandbox {name}: {message}")]
    SandboxCreate { name: String, message: String },

    #[error("Failed to destroy sandbox {name}: {message}")]
    SandboxDestroy { name: String, message: String },

    #[error("Failed to start job in sandbox {name}: {message}")]
    JobStart { name: String, message: String },

    #[error("Failed to stream logs for service {service} in {name}: {message}")]
    Logs {
        name: String,
        service: String,
        message: String,
    },

    #[error("Service {service} not found in {name}")]
    ServiceNotFound { name: String, service: String },

    #[error("Failed to query services in {name}: {message}")]
    Services { name: String, message: String },

    #[error("Failed to exec in service {service} of {name}: {message}")]
    Exec {
        name: String,
        service: String,
        message: String,
    },

    #[error("Failed to spawn runner process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A native event whose payload could not be turned into a canonical event.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Failed to encode {kind} payload: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Deployment {0} not found")]
    DeploymentNotFound(String),

    #[error("Deployment {0} already exists")]
    DeploymentExists(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}
