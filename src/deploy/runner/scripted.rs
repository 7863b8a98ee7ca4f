use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;

use crate::deploy::models::{ExecResult, InstructionArg, JobSpec, NativeEvent, ServiceInfo};
use crate::errors::RunnerError;

use super::{JobRun, LogBatch, LogRequest, LogSource, SandboxHandle, WorkloadRunner};

/// A call made against a [`ScriptedRunner`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCall {
    CreateSandbox(String),
    DestroySandbox(String),
    RunJob { sandbox: String, package_url: String },
    Exec { service: String, command: Vec<String> },
}

/// Runner that replays a fixed list of native events for every job.
///
/// Used by tests and by `runner.kind = "scripted"` for offline demos.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Vec<NativeEvent>,
    event_delay: Duration,
    hold_open: bool,
    sandbox_failure: Option<String>,
    job_failure: Option<String>,
    destroy_failure: Option<String>,
    service_logs: HashMap<String, Vec<String>>,
    services: BTreeMap<String, ServiceInfo>,
    exec_results: HashMap<String, ExecResult>,
    calls: Mutex<Vec<RunnerCall>>,
    log_requests: Mutex<Vec<LogRequest>>,
    jobs: Mutex<Vec<CancellationToken>>,
}

impl ScriptedRunner {
    pub fn new(script: Vec<NativeEvent>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// A short successful run with a couple of services.
    pub fn demo() -> Self {
        let step = |info: &str, current, total| NativeEvent::Progress {
            step_info: vec![info.to_string()],
            current_step: current,
            total_steps: total,
        };
        Self::new(vec![
            step("Interpreting package", 1, 4),
            NativeEvent::Instruction {
                name: "add_service".to_string(),
                executable: "add_service(name=\"el-1\", config=ServiceConfig(image=\"geth\"))"
                    .to_string(),
                arguments: vec![InstructionArg {
                    name: Some("name".to_string()),
                    serialized_value: "\"el-1\"".to_string(),
                    is_representative: true,
                }],
            },
            NativeEvent::InstructionResult {
                serialized_result: "Service 'el-1' added".to_string(),
            },
            step("Starting services", 3, 4),
            NativeEvent::Info {
                message: "All services healthy".to_string(),
            },
            NativeEvent::RunFinished {
                success: true,
                output: None,
            },
        ])
        .with_event_delay(Duration::from_millis(200))
        .with_service_logs("el-1", vec!["INFO starting el-1".to_string()])
        .with_service(ServiceInfo {
            name: "el-1".to_string(),
            uuid: "5a1c0e7f9b2d".to_string(),
            private_ip: "172.16.0.4".to_string(),
            private_ports: BTreeMap::from([("rpc".to_string(), 8545)]),
            public_ip: Some("127.0.0.1".to_string()),
            public_ports: BTreeMap::from([("rpc".to_string(), 32769)]),
        })
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Keep the job's event stream open after the script until cancelled.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn with_sandbox_failure(mut self, message: &str) -> Self {
        self.sandbox_failure = Some(message.to_string());
        self
    }

    pub fn with_job_failure(mut self, message: &str) -> Self {
        self.job_failure = Some(message.to_string());
        self
    }

    pub fn with_destroy_failure(mut self, message: &str) -> Self {
        self.destroy_failure = Some(message.to_string());
        self
    }

    pub fn with_service_logs(mut self, service: &str, lines: Vec<String>) -> Self {
        self.service_logs.insert(service.to_string(), lines);
        self
    }

    pub fn with_service(mut self, info: ServiceInfo) -> Self {
        self.services.insert(info.name.clone(), info);
        self
    }

    /// Fixed result for every exec in `service`. Without one, exec echoes
    /// the command back with exit code 0.
    pub fn with_exec_result(mut self, service: &str, result: ExecResult) -> Self {
        self.exec_results.insert(service.to_string(), result);
        self
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RunnerCall::DestroySandbox(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn log_requests(&self) -> Vec<LogRequest> {
        self.log_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// True once every started job has been cancelled.
    pub fn jobs_cancelled(&self) -> bool {
        self.jobs
            .lock()
            .map(|jobs| jobs.iter().all(CancellationToken::is_cancelled))
            .unwrap_or(false)
    }

    fn record(&self, call: RunnerCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl WorkloadRunner for ScriptedRunner {
    async fn create_sandbox(&self, name: &str) -> Result<SandboxHandle, RunnerError> {
        self.record(RunnerCall::CreateSandbox(name.to_string()));
        if let Some(message) = &self.sandbox_failure {
            return Err(RunnerError::SandboxCreate {
                name: name.to_string(),
                message: message.clone(),
            });
        }
        Ok(SandboxHandle {
            name: name.to_string(),
        })
    }

    async fn destroy_sandbox(&self, name: &str) -> Result<(), RunnerError> {
        self.record(RunnerCall::DestroySandbox(name.to_string()));
        match &self.destroy_failure {
            Some(message) => Err(RunnerError::SandboxDestroy {
                name: name.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn run_job(
        &self,
        sandbox: &SandboxHandle,
        job: &JobSpec,
    ) -> Result<JobRun, RunnerError> {
        self.record(RunnerCall::RunJob {
            sandbox: sandbox.name.clone(),
            package_url: job.package_url.clone(),
        });
        if let Some(message) = &self.job_failure {
            return Err(RunnerError::JobStart {
                name: sandbox.name.clone(),
                message: message.clone(),
            });
        }

        let cancel = CancellationToken::new();
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(cancel.clone());
        }

        let delay = self.event_delay;
        let scripted = stream::iter(self.script.clone()).then(move |event| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            event
        });
        let events = if self.hold_open {
            scripted.chain(stream::pending()).boxed()
        } else {
            scripted.boxed()
        };
        Ok(JobRun {
            events: events.take_until(cancel.clone().cancelled_owned()).boxed(),
            cancel,
        })
    }

    /// Lines are returned whole; `max_lines` is enforced by the consumer.
    async fn service_logs(
        &self,
        _sandbox: &str,
        request: &LogRequest,
    ) -> Result<LogSource, RunnerError> {
        if let Ok(mut requests) = self.log_requests.lock() {
            requests.push(request.clone());
        }
        let Some(lines) = self.service_logs.get(&request.service) else {
            let missing = LogBatch {
                lines: Vec::new(),
                not_found: true,
            };
            return Ok(stream::iter(vec![Ok(missing)]).boxed());
        };
        let lines: Vec<String> = lines
            .iter()
            .filter(|line| {
                request
                    .filter
                    .as_deref()
                    .is_none_or(|needle| line.contains(needle))
            })
            .cloned()
            .collect();

        if request.follow {
            let batches = lines.into_iter().map(|line| {
                Ok(LogBatch {
                    lines: vec![line],
                    not_found: false,
                })
            });
            Ok(stream::iter(batches).chain(stream::pending()).boxed())
        } else {
            let batch = LogBatch {
                lines,
                not_found: false,
            };
            Ok(stream::iter(vec![Ok(batch)]).boxed())
        }
    }

    async fn services(&self, _sandbox: &str) -> Result<Vec<ServiceInfo>, RunnerError> {
        Ok(self.services.values().cloned().collect())
    }

    async fn exec(
        &self,
        sandbox: &str,
        service: &str,
        command: &[String],
    ) -> Result<ExecResult, RunnerError> {
        self.record(RunnerCall::Exec {
            service: service.to_string(),
            command: command.to_vec(),
        });
        if !self.services.contains_key(service) {
            return Err(RunnerError::ServiceNotFound {
                name: sandbox.to_string(),
                service: service.to_string(),
            });
        }
        Ok(self
            .exec_results
            .get(service)
            .cloned()
            .unwrap_or_else(|| ExecResult {
                exit_code: 0,
                output: command.join(" "),
            }))
    }
}
