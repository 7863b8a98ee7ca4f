//! Drives deployment runs end to end.
//!
//! A run moves through `Created → SandboxCreated → StreamingEvents →
//! Finished`, leaving early as `Aborted` when its token fires or the
//! deployment reads terminated. The coordinator is the only writer of a
//! session's event log, so it also owns `seq` assignment.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::errors::{OrchestratorError, StoreError};

use super::event_log::EventLog;
use super::lifecycle::{Lifecycle, StopOutcome, Target, TransitionOutcome};
use super::models::{
    Event, EventPayload, ExecResult, JobSpec, RunRequest, RunTicket, ServiceInfo,
};
use super::registry::{SessionInfo, SessionRegistry};
use super::runner::{JobRun, SandboxHandle, WorkloadRunner};
use super::tailer::ServiceLogStore;
use super::translator::{Signal, translate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Created,
    SandboxCreated,
    StreamingEvents,
    Finished,
    Aborted,
}

/// How the event stream of a job ended.
enum StreamEnd {
    Succeeded,
    Failed,
    Fatal,
    Exhausted,
    Cancelled,
}

/// State owned by one run task.
struct Run {
    session_id: String,
    deployment: String,
    job: JobSpec,
    token: CancellationToken,
    next_seq: u64,
}

#[derive(Clone)]
pub struct RunCoordinator {
    events: Arc<dyn EventLog>,
    lifecycle: Lifecycle,
    registry: Arc<SessionRegistry>,
    runner: Arc<dyn WorkloadRunner>,
    service_logs: Arc<dyn ServiceLogStore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    prune_on_stop: bool,
}

impl RunCoordinator {
    pub fn new(
        events: Arc<dyn EventLog>,
        lifecycle: Lifecycle,
        registry: Arc<SessionRegistry>,
        runner: Arc<dyn WorkloadRunner>,
        service_logs: Arc<dyn ServiceLogStore>,
    ) -> Self {
        Self {
            events,
            lifecycle,
            registry,
            runner,
            service_logs,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            prune_on_stop: true,
        }
    }

    pub fn with_prune_on_stop(mut self, prune: bool) -> Self {
        self.prune_on_stop = prune;
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Registered sessions of a deployment and their observer counts.
    pub fn sessions(&self, deployment: &str) -> Vec<SessionInfo> {
        self.registry.sessions_for(deployment)
    }

    /// Services running in a live deployment's sandbox.
    pub async fn services(&self, deployment: &str) -> Result<Vec<ServiceInfo>, OrchestratorError> {
        self.lifecycle.require_live(deployment).await?;
        Ok(self.runner.services(deployment).await?)
    }

    /// Run a command inside one service of a live deployment.
    pub async fn exec(
        &self,
        deployment: &str,
        service: &str,
        command: &[String],
    ) -> Result<ExecResult, OrchestratorError> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(OrchestratorError::BadRequest(
                "command is required".to_string(),
            ));
        }
        self.lifecycle.require_live(deployment).await?;
        let result = self.runner.exec(deployment, service, command).await?;
        tracing::info!(
            deployment = %deployment,
            service = %service,
            exit_code = result.exit_code,
            "command executed"
        );
        Ok(result)
    }

    /// Validate the request, create the deployment and spawn its run.
    /// Returns as soon as the run task is scheduled.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunTicket, OrchestratorError> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        validate_name(&request.deployment)?;
        if request.job.package_url.trim().is_empty() {
            return Err(OrchestratorError::BadRequest(
                "package_url is required".to_string(),
            ));
        }

        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.registry.contains(&session_id)
            || !self.events.read_all(&session_id).await?.is_empty()
        {
            return Err(OrchestratorError::BadRequest(format!(
                "Session {} already exists",
                session_id
            )));
        }

        self.lifecycle
            .begin(&request.deployment, request.subscription)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists(name) => OrchestratorError::DeploymentExists(name),
                other => other.into(),
            })?;
        let token = self.registry.register(&session_id, &request.deployment)?;

        let run = Run {
            session_id: session_id.clone(),
            deployment: request.deployment.clone(),
            job: request.job,
            token,
            next_seq: 0,
        };
        let span = tracing::info_span!(
            "run",
            deployment = %request.deployment,
            session_id = %session_id
        );
        let this = self.clone();
        self.tracker.spawn(
            async move {
                let phase = this.execute(run).await;
                tracing::debug!(phase = ?phase, "run task exited");
            }
            .instrument(span),
        );

        tracing::info!(
            deployment = %request.deployment,
            session_id = %session_id,
            "run started"
        );
        Ok(RunTicket {
            session_id,
            deployment: request.deployment,
        })
    }

    async fn execute(&self, mut run: Run) -> RunPhase {
        // Created
        if self.should_abort(&run).await {
            return self.aborted(&run, RunPhase::Created, None).await;
        }
        let sandbox = match self.runner.create_sandbox(&run.deployment).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                tracing::error!(deployment = %run.deployment, error = %e, "sandbox creation failed");
                self.fail_run(&mut run, EventPayload::error(&e), None).await;
                return RunPhase::Finished;
            }
        };

        // SandboxCreated: a stop that landed during creation could not see
        // this sandbox, so tear it down here.
        if self.should_abort(&run).await {
            if !self.shutdown.is_cancelled() {
                self.teardown(&run.deployment).await;
            }
            return self
                .aborted(&run, RunPhase::SandboxCreated, Some(&sandbox))
                .await;
        }
        let job = match self.runner.run_job(&sandbox, &run.job).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(deployment = %run.deployment, error = %e, "job start failed");
                self.fail_run(&mut run, EventPayload::error(&e), Some(&sandbox))
                    .await;
                return RunPhase::Finished;
            }
        };

        // StreamingEvents
        match self.stream_events(&mut run, job).await {
            StreamEnd::Succeeded => {
                self.finish(&run, Target::Operational, None).await;
            }
            StreamEnd::Failed | StreamEnd::Fatal => {
                if self.finish(&run, Target::Error, Some(Utc::now())).await {
                    self.teardown(&run.deployment).await;
                }
            }
            StreamEnd::Exhausted => {
                tracing::warn!(deployment = %run.deployment, "job stream ended before the run finished");
                self.fail_run(
                    &mut run,
                    EventPayload::error("job stream ended before the run finished"),
                    Some(&sandbox),
                )
                .await;
            }
            StreamEnd::Cancelled => {
                return self
                    .aborted(&run, RunPhase::StreamingEvents, Some(&sandbox))
                    .await;
            }
        }
        RunPhase::Finished
    }

    async fn stream_events(&self, run: &mut Run, job: JobRun) -> StreamEnd {
        let JobRun { mut events, cancel } = job;
        let end = loop {
            let native = tokio::select! {
                biased;
                _ = run.token.cancelled() => break StreamEnd::Cancelled,
                next = events.next() => next,
            };
            let Some(native) = native else {
                break StreamEnd::Exhausted;
            };

            let translation = match translate(&native) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(deployment = %run.deployment, error = %e, "dropping untranslatable event");
                    continue;
                }
            };
            if let Some(payload) = translation.event {
                self.emit(run, payload).await;
            }
            match translation.signal {
                Signal::Continue => {}
                Signal::Fatal => break StreamEnd::Fatal,
                Signal::Finished { success: true } => break StreamEnd::Succeeded,
                Signal::Finished { success: false } => break StreamEnd::Failed,
            }
        };
        cancel.cancel();
        end
    }

    /// Append then publish. A failed append is logged and the event still
    /// goes out to live observers. Nothing is written once the run is
    /// cancelled.
    async fn emit(&self, run: &mut Run, payload: EventPayload) {
        if run.token.is_cancelled() {
            tracing::debug!(session_id = %run.session_id, "run cancelled, event dropped");
            return;
        }
        let event = Event::new(run.next_seq, payload);
        run.next_seq += 1;
        if let Err(e) = self.events.append(&run.session_id, &event).await {
            tracing::error!(
                session_id = %run.session_id,
                seq = event.seq,
                error = %e,
                "failed to append event"
            );
        }
        if let Err(e) = self.events.publish(&run.session_id, &event).await {
            tracing::warn!(session_id = %run.session_id, seq = event.seq, error = %e, "failed to publish event");
        }
    }

    async fn fail_run(&self, run: &mut Run, payload: EventPayload, sandbox: Option<&SandboxHandle>) {
        self.emit(run, payload).await;
        if self.finish(run, Target::Error, Some(Utc::now())).await
            && let Some(sandbox) = sandbox
        {
            self.teardown(&sandbox.name).await;
        }
    }

    /// Apply the terminal transition of a run. Returns true if it was written.
    async fn finish(
        &self,
        run: &Run,
        target: Target,
        deletion_date: Option<chrono::DateTime<Utc>>,
    ) -> bool {
        match self
            .lifecycle
            .transition(&run.deployment, target, deletion_date)
            .await
        {
            Ok(TransitionOutcome::Applied(record)) => {
                tracing::info!(deployment = %run.deployment, status = %record.status, "run finished");
                true
            }
            Ok(TransitionOutcome::Aborted) => {
                tracing::info!(deployment = %run.deployment, "run finished after stop, status left terminated");
                false
            }
            Ok(TransitionOutcome::LostRace) => {
                tracing::warn!(deployment = %run.deployment, target = ?target, "run status write lost to concurrent writers");
                false
            }
            Ok(TransitionOutcome::Rejected { current }) => {
                tracing::warn!(deployment = %run.deployment, current = %current, target = ?target, "run status write rejected");
                false
            }
            Err(e) => {
                tracing::error!(deployment = %run.deployment, error = %e, "failed to update deployment status");
                false
            }
        }
    }

    async fn should_abort(&self, run: &Run) -> bool {
        if run.token.is_cancelled() {
            return true;
        }
        match self.lifecycle.is_terminated(&run.deployment).await {
            Ok(terminated) => terminated,
            Err(e) => {
                tracing::warn!(deployment = %run.deployment, error = %e, "status check failed, continuing");
                false
            }
        }
    }

    /// Leave a run early.
    ///
    /// Shutdown fails the deployment, so the record is never left pending
    /// across a restart, and tears down the sandbox like any other failure.
    /// A stop may have pruned while this run was mid-append, so the run
    /// drops its own session log again on the way out.
    async fn aborted(
        &self,
        run: &Run,
        at: RunPhase,
        sandbox: Option<&SandboxHandle>,
    ) -> RunPhase {
        if self.shutdown.is_cancelled() {
            tracing::warn!(deployment = %run.deployment, session_id = %run.session_id, phase = ?at, "run interrupted by shutdown");
            if self.finish(run, Target::Error, Some(Utc::now())).await
                && let Some(sandbox) = sandbox
            {
                self.teardown(&sandbox.name).await;
            }
            return RunPhase::Aborted;
        }

        tracing::info!(deployment = %run.deployment, session_id = %run.session_id, phase = ?at, "run aborted");
        if self.prune_on_stop
            && let Err(e) = self.events.prune(&run.session_id).await
        {
            tracing::warn!(session_id = %run.session_id, error = %e, "failed to prune session log");
        }
        RunPhase::Aborted
    }

    async fn teardown(&self, deployment: &str) {
        match self.runner.destroy_sandbox(deployment).await {
            Ok(()) => tracing::info!(deployment = %deployment, "sandbox destroyed"),
            Err(e) => tracing::warn!(deployment = %deployment, error = %e, "failed to destroy sandbox"),
        }
    }

    /// Terminate a deployment: write the terminal status, cancel its runs and
    /// tails, destroy the sandbox unless a failure already did, and prune.
    pub async fn stop(&self, deployment: &str) -> Result<StopOutcome, OrchestratorError> {
        let outcome = self.lifecycle.stop(deployment).await.map_err(|e| match e {
            StoreError::NotFound(name) => OrchestratorError::DeploymentNotFound(name),
            other => other.into(),
        })?;
        if outcome.already_terminated {
            tracing::debug!(deployment = %deployment, "stop on terminated deployment");
            return Ok(outcome);
        }

        self.registry.cancel_deployment(deployment);
        if outcome.teardown_required {
            self.teardown(deployment).await;
        }
        if self.prune_on_stop {
            self.prune(deployment).await;
        }
        tracing::info!(deployment = %deployment, status = %outcome.status, "deployment stopped");
        Ok(outcome)
    }

    async fn prune(&self, deployment: &str) {
        for session_id in self.registry.remove_deployment(deployment) {
            if let Err(e) = self.events.prune(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "failed to prune session log");
            }
        }
        if let Err(e) = self.service_logs.delete_deployment(deployment).await {
            tracing::warn!(deployment = %deployment, error = %e, "failed to prune service logs");
        }
    }

    /// Wait until every spawned run task has exited.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Refuse new runs, cancel in-flight ones and wait for them. Interrupted
    /// runs end in the error status of their track.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.cancel_all();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("run coordinator stopped");
    }
}

/// Deployment names become sandbox names: 1-63 chars of `[A-Za-z0-9_-]`.
fn validate_name(name: &str) -> Result<(), OrchestratorError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::BadRequest(format!(
            "Invalid deployment name: {:?}",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{Notify, broadcast};

    use crate::deploy::event_log::MemoryEventLog;
    use crate::deploy::lifecycle::{DEFAULT_CAS_RETRIES, MemoryLifecycleStore};
    use crate::deploy::models::{DeploymentStatus, InstructionArg, NativeEvent};
    use crate::deploy::runner::ScriptedRunner;
    use crate::deploy::tailer::MemoryServiceLogStore;
    use crate::deploy::translator::RUN_SUCCEEDED_INFO;
    use crate::errors::RunnerError;

    struct Harness {
        coordinator: RunCoordinator,
        events: Arc<dyn EventLog>,
        runner: Arc<ScriptedRunner>,
        registry: Arc<SessionRegistry>,
    }

    fn harness_with(runner: ScriptedRunner, events: Arc<dyn EventLog>, prune: bool) -> Harness {
        let runner = Arc::new(runner);
        let registry = Arc::new(SessionRegistry::new());
        let lifecycle = Lifecycle::new(Arc::new(MemoryLifecycleStore::new()), DEFAULT_CAS_RETRIES);
        let coordinator = RunCoordinator::new(
            Arc::clone(&events),
            lifecycle,
            Arc::clone(&registry),
            runner.clone(),
            Arc::new(MemoryServiceLogStore::new()),
        )
        .with_prune_on_stop(prune);
        Harness {
            coordinator,
            events,
            runner,
            registry,
        }
    }

    fn harness(runner: ScriptedRunner) -> Harness {
        harness_with(runner, Arc::new(MemoryEventLog::new()), false)
    }

    fn request(name: &str, session: &str) -> RunRequest {
        RunRequest {
            deployment: name.to_string(),
            session_id: Some(session.to_string()),
            job: JobSpec {
                package_url: "github.com/org/pkg".to_string(),
                params: serde_json::json!({}),
            },
            subscription: false,
        }
    }

    fn progress(info: &str) -> NativeEvent {
        NativeEvent::Progress {
            step_info: vec![info.to_string()],
            current_step: 1,
            total_steps: 2,
        }
    }

    fn finished(success: bool) -> NativeEvent {
        NativeEvent::RunFinished {
            success,
            output: None,
        }
    }

    async fn kinds(events: &Arc<dyn EventLog>, session: &str) -> Vec<&'static str> {
        events
            .read_all(session)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind())
            .collect()
    }

    async fn status(h: &Harness, name: &str) -> DeploymentStatus {
        h.coordinator
            .lifecycle()
            .get(name)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_successful_run_becomes_operational() {
        let h = harness(ScriptedRunner::new(vec![
            progress("P1"),
            NativeEvent::Instruction {
                name: "add_service".to_string(),
                executable: "add_service(name=\"el-1\")".to_string(),
                arguments: vec![InstructionArg {
                    name: Some("name".to_string()),
                    serialized_value: "\"el-1\"".to_string(),
                    is_representative: true,
                }],
            },
            finished(true),
        ]));
        let ticket = h.coordinator.start_run(request("d1", "s1")).await.unwrap();
        assert_eq!(ticket.session_id, "s1");
        h.coordinator.drain().await;

        assert_eq!(
            kinds(&h.events, "s1").await,
            vec!["progress", "instruction", "progress"]
        );
        let stored = h.events.read_all("s1").await.unwrap();
        assert_eq!(stored.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        match &stored[2].payload {
            EventPayload::Progress { info, .. } => assert_eq!(info, RUN_SUCCEEDED_INFO),
            other => panic!("Expected progress, got {:?}", other),
        }
        assert_eq!(status(&h, "d1").await, DeploymentStatus::Operational);
        assert!(h.runner.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_execution_error_fails_and_tears_down() {
        let h = harness(ScriptedRunner::new(vec![
            NativeEvent::Error {
                message: "image not found".to_string(),
            },
            progress("never seen"),
            finished(true),
        ]));
        h.coordinator.start_run(request("d2", "s2")).await.unwrap();
        h.coordinator.drain().await;

        let stored = h.events.read_all("s2").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, EventPayload::error("image not found"));

        let record = h.coordinator.lifecycle().get("d2").await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Error);
        assert!(record.deletion_date.is_some());
        assert_eq!(h.runner.destroyed(), vec!["d2".to_string()]);
        assert!(h.runner.jobs_cancelled());
    }

    #[tokio::test]
    async fn test_stop_mid_run_aborts_without_further_writes() {
        let h = harness(ScriptedRunner::new(vec![progress("P1")]).hold_open());
        h.coordinator.start_run(request("d3", "s3")).await.unwrap();
        wait_for_events(&h.events, "s3").await;

        let outcome = h.coordinator.stop("d3").await.unwrap();
        assert!(outcome.teardown_required);
        h.coordinator.drain().await;

        assert_eq!(kinds(&h.events, "s3").await, vec!["progress"]);
        assert_eq!(status(&h, "d3").await, DeploymentStatus::Terminated);
        assert_eq!(h.runner.destroyed(), vec!["d3".to_string()]);
        assert!(h.runner.jobs_cancelled());
    }

    #[tokio::test]
    async fn test_sandbox_failure_records_error() {
        let h = harness(
            ScriptedRunner::new(vec![finished(true)]).with_sandbox_failure("quota exceeded"),
        );
        h.coordinator.start_run(request("d4", "s4")).await.unwrap();
        h.coordinator.drain().await;

        let stored = h.events.read_all("s4").await.unwrap();
        assert_eq!(stored.len(), 1);
        match &stored[0].payload {
            EventPayload::Error { info } => {
                assert!(info.starts_with("Error: "));
                assert!(info.contains("quota exceeded"));
            }
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(status(&h, "d4").await, DeploymentStatus::Error);
        assert!(h.runner.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_job_start_failure_tears_down_sandbox() {
        let h = harness(ScriptedRunner::new(Vec::new()).with_job_failure("bad package"));
        h.coordinator.start_run(request("d5", "s5")).await.unwrap();
        h.coordinator.drain().await;

        assert_eq!(kinds(&h.events, "s5").await, vec!["error"]);
        assert_eq!(status(&h, "d5").await, DeploymentStatus::Error);
        assert_eq!(h.runner.destroyed(), vec!["d5".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_finish_moves_to_error() {
        let h = harness(ScriptedRunner::new(vec![progress("P1"), finished(false)]));
        h.coordinator.start_run(request("d6", "s6")).await.unwrap();
        h.coordinator.drain().await;

        assert_eq!(kinds(&h.events, "s6").await, vec!["progress"]);
        assert_eq!(status(&h, "d6").await, DeploymentStatus::Error);
    }

    #[tokio::test]
    async fn test_stream_without_finish_moves_to_error() {
        let h = harness(ScriptedRunner::new(vec![progress("P1")]));
        h.coordinator.start_run(request("d7", "s7")).await.unwrap();
        h.coordinator.drain().await;

        assert_eq!(kinds(&h.events, "s7").await, vec!["progress", "error"]);
        assert_eq!(status(&h, "d7").await, DeploymentStatus::Error);
    }

    #[tokio::test]
    async fn test_subscription_run_stays_on_its_track() {
        let h = harness(ScriptedRunner::new(vec![finished(true)]));
        let mut req = request("d8", "s8");
        req.subscription = true;
        h.coordinator.start_run(req).await.unwrap();
        h.coordinator.drain().await;
        assert_eq!(status(&h, "d8").await, DeploymentStatus::SubscriptionOperational);

        let stop = h.coordinator.stop("d8").await.unwrap();
        assert_eq!(stop.status, DeploymentStatus::SubscriptionTerminated);
    }

    #[tokio::test]
    async fn test_stop_after_error_skips_teardown_and_is_idempotent() {
        let h = harness(ScriptedRunner::new(vec![NativeEvent::Error {
            message: "boom".to_string(),
        }]));
        h.coordinator.start_run(request("d9", "s9")).await.unwrap();
        h.coordinator.drain().await;
        assert_eq!(h.runner.destroyed().len(), 1);

        let first = h.coordinator.stop("d9").await.unwrap();
        assert!(!first.teardown_required);
        let second = h.coordinator.stop("d9").await.unwrap();
        assert!(second.already_terminated);
        assert_eq!(h.runner.destroyed().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_prunes_session_logs() {
        let h = harness_with(
            ScriptedRunner::new(vec![finished(true)]),
            Arc::new(MemoryEventLog::new()),
            true,
        );
        h.coordinator.start_run(request("d10", "s10")).await.unwrap();
        h.coordinator.drain().await;
        assert!(!h.events.read_all("s10").await.unwrap().is_empty());

        h.coordinator.stop("d10").await.unwrap();
        assert!(h.events.read_all("s10").await.unwrap().is_empty());
        assert!(!h.registry.contains("s10"));
    }

    #[tokio::test]
    async fn test_start_run_rejections() {
        let h = harness(ScriptedRunner::new(vec![finished(true)]));
        h.coordinator.start_run(request("d11", "s11")).await.unwrap();

        assert!(matches!(
            h.coordinator.start_run(request("d11", "other")).await,
            Err(OrchestratorError::DeploymentExists(_))
        ));
        assert!(matches!(
            h.coordinator.start_run(request("d12", "s11")).await,
            Err(OrchestratorError::BadRequest(_))
        ));
        assert!(matches!(
            h.coordinator.start_run(request("bad name!", "s13")).await,
            Err(OrchestratorError::BadRequest(_))
        ));
        let mut no_package = request("d14", "s14");
        no_package.job.package_url = "  ".to_string();
        assert!(matches!(
            h.coordinator.start_run(no_package).await,
            Err(OrchestratorError::BadRequest(_))
        ));
        assert!(matches!(
            h.coordinator.stop("ghost").await,
            Err(OrchestratorError::DeploymentNotFound(_))
        ));
        h.coordinator.drain().await;

        // Terminated names stay taken.
        h.coordinator.stop("d11").await.unwrap();
        assert!(matches!(
            h.coordinator.start_run(request("d11", "s11b")).await,
            Err(OrchestratorError::DeploymentExists(_))
        ));
    }

    #[tokio::test]
    async fn test_generated_session_id() {
        let h = harness(ScriptedRunner::new(vec![finished(true)]));
        let mut req = request("d15", "");
        req.session_id = None;
        let ticket = h.coordinator.start_run(req).await.unwrap();
        assert!(Uuid::parse_str(&ticket.session_id).is_ok());
        h.coordinator.drain().await;
    }

    async fn wait_for_events(events: &Arc<dyn EventLog>, session: &str) {
        let mut waited = 0;
        while events.read_all(session).await.unwrap().is_empty() {
            assert!(waited < 200, "run never emitted its first event");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
    }

    #[tokio::test]
    async fn test_shutdown_fails_in_flight_runs_and_refuses_new_ones() {
        let h = harness(ScriptedRunner::new(vec![progress("P1")]).hold_open());
        h.coordinator.start_run(request("d16", "s16")).await.unwrap();
        wait_for_events(&h.events, "s16").await;
        tokio::time::timeout(Duration::from_secs(5), h.coordinator.shutdown())
            .await
            .unwrap();

        let record = h.coordinator.lifecycle().get("d16").await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Error);
        assert!(record.deletion_date.is_some());
        assert_eq!(h.runner.destroyed(), vec!["d16".to_string()]);
        assert!(h.runner.jobs_cancelled());
        assert_eq!(kinds(&h.events, "s16").await, vec!["progress"]);
        assert!(matches!(
            h.coordinator.start_run(request("d17", "s17")).await,
            Err(OrchestratorError::ShuttingDown)
        ));

        // A later stop does not tear down a second time.
        let stop = h.coordinator.stop("d16").await.unwrap();
        assert_eq!(stop.status, DeploymentStatus::Terminated);
        assert!(!stop.teardown_required);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_subscription_track() {
        let h = harness(ScriptedRunner::new(vec![progress("P1")]).hold_open());
        let mut req = request("d19", "s19");
        req.subscription = true;
        h.coordinator.start_run(req).await.unwrap();
        wait_for_events(&h.events, "s19").await;
        h.coordinator.shutdown().await;

        assert_eq!(status(&h, "d19").await, DeploymentStatus::SubscriptionError);
    }

    #[tokio::test]
    async fn test_teardown_failure_still_marks_error() {
        let h = harness(
            ScriptedRunner::new(vec![NativeEvent::Error {
                message: "image not found".to_string(),
            }])
            .with_destroy_failure("sandbox busy"),
        );
        h.coordinator.start_run(request("d20", "s20")).await.unwrap();
        h.coordinator.drain().await;

        let record = h.coordinator.lifecycle().get("d20").await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Error);
        assert!(record.deletion_date.is_some());
        assert_eq!(h.runner.destroyed(), vec!["d20".to_string()]);
        assert_eq!(kinds(&h.events, "s20").await, vec!["error"]);
    }

    /// Event log whose appends wait for the test to release them.
    struct GatedAppends {
        inner: MemoryEventLog,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl EventLog for GatedAppends {
        async fn append(&self, session_id: &str, event: &Event) -> Result<(), StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.append(session_id, event).await
        }

        async fn read_all(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
            self.inner.read_all(session_id).await
        }

        async fn publish(&self, session_id: &str, event: &Event) -> Result<(), StoreError> {
            self.inner.publish(session_id, event).await
        }

        async fn subscribe(
            &self,
            session_id: &str,
        ) -> Result<broadcast::Receiver<Event>, StoreError> {
            self.inner.subscribe(session_id).await
        }

        async fn prune(&self, session_id: &str) -> Result<(), StoreError> {
            self.inner.prune(session_id).await
        }
    }

    #[tokio::test]
    async fn test_append_landing_after_stop_is_pruned() {
        let gated = Arc::new(GatedAppends {
            inner: MemoryEventLog::new(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let h = harness_with(
            ScriptedRunner::new(vec![progress("P1"), progress("P2")]).hold_open(),
            gated.clone(),
            true,
        );
        h.coordinator.start_run(request("d21", "s21")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), gated.entered.notified())
            .await
            .unwrap();

        // The run is inside its first append while the stop prunes.
        h.coordinator.stop("d21").await.unwrap();
        gated.release.notify_one();
        tokio::time::timeout(Duration::from_secs(5), h.coordinator.drain())
            .await
            .unwrap();

        assert!(h.events.read_all("s21").await.unwrap().is_empty());
        assert!(!h.registry.contains("s21"));
        assert_eq!(status(&h, "d21").await, DeploymentStatus::Terminated);
    }

    /// Event log whose appends always fail.
    struct BrokenAppends(MemoryEventLog);

    #[async_trait]
    impl EventLog for BrokenAppends {
        async fn append(&self, _: &str, _: &Event) -> Result<(), StoreError> {
            Err(StoreError::Database(anyhow::anyhow!("disk full")))
        }

        async fn read_all(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
            self.0.read_all(session_id).await
        }

        async fn publish(&self, session_id: &str, event: &Event) -> Result<(), StoreError> {
            self.0.publish(session_id, event).await
        }

        async fn subscribe(
            &self,
            session_id: &str,
        ) -> Result<broadcast::Receiver<Event>, StoreError> {
            self.0.subscribe(session_id).await
        }

        async fn prune(&self, session_id: &str) -> Result<(), StoreError> {
            self.0.prune(session_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_append_still_publishes() {
        let events: Arc<dyn EventLog> = Arc::new(BrokenAppends(MemoryEventLog::new()));
        let h = harness_with(
            ScriptedRunner::new(vec![progress("P1"), finished(true)]),
            events,
            false,
        );
        let mut rx = h.events.subscribe("s18").await.unwrap();
        h.coordinator.start_run(request("d18", "s18")).await.unwrap();
        h.coordinator.drain().await;

        assert_eq!(rx.recv().await.unwrap().seq, 0);
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert!(h.events.read_all("s18").await.unwrap().is_empty());
        assert_eq!(status(&h, "d18").await, DeploymentStatus::Operational);
    }

    #[tokio::test]
    async fn test_services_and_exec_on_live_deployment() {
        let h = harness(ScriptedRunner::demo().with_event_delay(Duration::ZERO));
        h.coordinator.start_run(request("d22", "s22")).await.unwrap();
        h.coordinator.drain().await;

        let services = h.coordinator.services("d22").await.unwrap();
        assert_eq!(services[0].name, "el-1");
        let command = vec!["echo".to_string(), "ok".to_string()];
        let result = h.coordinator.exec("d22", "el-1", &command).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(matches!(
            h.coordinator.exec("d22", "ghost", &command).await,
            Err(OrchestratorError::Runner(RunnerError::ServiceNotFound { .. }))
        ));
        assert!(matches!(
            h.coordinator.exec("d22", "el-1", &[]).await,
            Err(OrchestratorError::BadRequest(_))
        ));

        h.coordinator.stop("d22").await.unwrap();
        assert!(matches!(
            h.coordinator.services("d22").await,
            Err(OrchestratorError::BadRequest(_))
        ));
        assert!(matches!(
            h.coordinator.services("ghost").await,
            Err(OrchestratorError::DeploymentNotFound(_))
        ));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("net-1_a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
        assert!(validate_name("a/b").is_err());
    }
}
