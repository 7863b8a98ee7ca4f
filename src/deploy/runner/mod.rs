//! Workload runner seam.
//!
//! The orchestrator never executes packages itself. A [`WorkloadRunner`]
//! provisions sandboxes, runs jobs inside them and streams service logs.
//! Two implementations:
//!
//! - [`ProcessRunner`] drives an external runner executable over JSON lines.
//! - [`ScriptedRunner`] replays a fixed event script (tests, offline mode).

mod process;
mod scripted;

pub use process::ProcessRunner;
pub use scripted::{RunnerCall, ScriptedRunner};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::RunnerError;

use super::models::{ExecResult, JobSpec, NativeEvent, ServiceInfo};

/// A provisioned sandbox ("enclave").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub name: String,
}

/// A started job. Dropping `events` or cancelling `cancel` stops it.
pub struct JobRun {
    pub events: BoxStream<'static, NativeEvent>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRequest {
    pub service: String,
    pub follow: bool,
    /// Only output of the service's current container, not earlier restarts.
    pub most_recent_only: bool,
    pub max_lines: usize,
    pub filter: Option<String>,
}

/// One chunk of service output as reported by the runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub not_found: bool,
}

/// Stream of log batches. Dropping it releases the runner-side reader.
pub type LogSource = BoxStream<'static, Result<LogBatch, RunnerError>>;

#[async_trait]
pub trait WorkloadRunner: Send + Sync {
    async fn create_sandbox(&self, name: &str) -> Result<SandboxHandle, RunnerError>;

    async fn destroy_sandbox(&self, name: &str) -> Result<(), RunnerError>;

    async fn run_job(&self, sandbox: &SandboxHandle, job: &JobSpec)
    -> Result<JobRun, RunnerError>;

    async fn service_logs(
        &self,
        sandbox: &str,
        request: &LogRequest,
    ) -> Result<LogSource, RunnerError>;

    /// Services running in the sandbox, sorted by name.
    async fn services(&self, sandbox: &str) -> Result<Vec<ServiceInfo>, RunnerError>;

    /// Run `command` inside a service and wait for it to exit.
    async fn exec(
        &self,
        sandbox: &str,
        service: &str,
        command: &[String],
    ) -> Result<ExecResult, RunnerError>;
}
