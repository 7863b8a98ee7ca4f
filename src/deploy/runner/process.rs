use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::deploy::models::{ExecResult, JobSpec, NativeEvent, ServiceInfo};
use crate::errors::RunnerError;

use super::{JobRun, LogBatch, LogRequest, LogSource, SandboxHandle, WorkloadRunner};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Drives an external runner executable.
///
/// ```text
/// <cmd> create-sandbox <name>
/// <cmd> destroy-sandbox <name>
/// <cmd> run <name> <package_url> <params-json>       stdout: NativeEvent JSON lines
/// <cmd> logs <name> <service> [--follow] [--most-recent] --max-lines N [--filter TEXT]
///                                                    stdout: LogBatch JSON lines
/// <cmd> services <name>                              stdout: ServiceInfo JSON array
/// <cmd> exec <name> <service> -- <command>...        stdout: {"exit_code","output"}
///                                                    or {"not_found":true}
/// ```
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: String,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run a one-shot subcommand and return its stdout. `Err` carries the
    /// runner's stderr.
    async fn invoke(&self, args: &[&str]) -> Result<Result<String, String>, RunnerError> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(RunnerError::Spawn)?;
        if output.status.success() {
            return Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok(Err(if stderr.is_empty() {
            format!("runner exited with {}", output.status)
        } else {
            stderr
        }))
    }

    fn spawn_streaming(&self, args: &[&str]) -> Result<(Child, ChildStdout), RunnerError> {
        let mut child = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(RunnerError::Spawn)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RunnerError::Spawn(std::io::Error::other("runner stdout was not captured"))
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(args.join(" "), stderr));
        }
        Ok((child, stdout))
    }
}

#[async_trait]
impl WorkloadRunner for ProcessRunner {
    async fn create_sandbox(&self, name: &str) -> Result<SandboxHandle, RunnerError> {
        self.invoke(&["create-sandbox", name])
            .await?
            .map_err(|message| RunnerError::SandboxCreate {
                name: name.to_string(),
                message,
            })?;
        Ok(SandboxHandle {
            name: name.to_string(),
        })
    }

    async fn destroy_sandbox(&self, name: &str) -> Result<(), RunnerError> {
        self.invoke(&["destroy-sandbox", name])
            .await?
            .map(|_| ())
            .map_err(|message| RunnerError::SandboxDestroy {
                name: name.to_string(),
                message,
            })
    }

    async fn run_job(
        &self,
        sandbox: &SandboxHandle,
        job: &JobSpec,
    ) -> Result<JobRun, RunnerError> {
        let params = serde_json::to_string(&job.params).map_err(|e| RunnerError::JobStart {
            name: sandbox.name.clone(),
            message: format!("invalid params: {}", e),
        })?;
        let (child, stdout) = self.spawn_streaming(&[
            "run",
            sandbox.name.as_str(),
            job.package_url.as_str(),
            params.as_str(),
        ])?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(pump_events(
            sandbox.name.clone(),
            child,
            stdout,
            tx,
            cancel.clone(),
        ));
        Ok(JobRun {
            events: ReceiverStream::new(rx).boxed(),
            cancel,
        })
    }

    async fn service_logs(
        &self,
        sandbox: &str,
        request: &LogRequest,
    ) -> Result<LogSource, RunnerError> {
        let max_lines = request.max_lines.to_string();
        let mut args = vec!["logs", sandbox, request.service.as_str()];
        if request.follow {
            args.push("--follow");
        }
        if request.most_recent_only {
            args.push("--most-recent");
        }
        args.extend(["--max-lines", max_lines.as_str()]);
        if let Some(filter) = &request.filter {
            args.extend(["--filter", filter.as_str()]);
        }
        let (child, stdout) = self.spawn_streaming(&args)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(pump_log_batches(
            sandbox.to_string(),
            request.service.clone(),
            child,
            stdout,
            tx,
        ));
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn services(&self, sandbox: &str) -> Result<Vec<ServiceInfo>, RunnerError> {
        let failed = |message: String| RunnerError::Services {
            name: sandbox.to_string(),
            message,
        };
        let stdout = self.invoke(&["services", sandbox]).await?.map_err(failed)?;
        let mut services: Vec<ServiceInfo> = serde_json::from_str(&stdout)
            .map_err(|e| failed(format!("malformed service list: {}", e)))?;
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn exec(
        &self,
        sandbox: &str,
        service: &str,
        command: &[String],
    ) -> Result<ExecResult, RunnerError> {
        let failed = |message: String| RunnerError::Exec {
            name: sandbox.to_string(),
            service: service.to_string(),
            message,
        };
        let mut args = vec!["exec", sandbox, service, "--"];
        args.extend(command.iter().map(String::as_str));
        let stdout = self.invoke(&args).await?.map_err(failed)?;
        let reply: ExecReply = serde_json::from_str(stdout.trim())
            .map_err(|e| failed(format!("malformed exec result: {}", e)))?;
        if reply.not_found {
            return Err(RunnerError::ServiceNotFound {
                name: sandbox.to_string(),
                service: service.to_string(),
            });
        }
        Ok(ExecResult {
            exit_code: reply.exit_code,
            output: reply.output,
        })
    }
}

#[derive(Deserialize)]
struct ExecReply {
    #[serde(default)]
    not_found: bool,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    output: String,
}

async fn pump_events(
    sandbox: String,
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<NativeEvent>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(sandbox = %sandbox, "job cancelled, killing runner");
                if let Err(e) = child.kill().await {
                    tracing::warn!(sandbox = %sandbox, error = %e, "failed to kill runner");
                }
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<NativeEvent>(&line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            // Consumer gone.
                            let _ = child.kill().await;
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(sandbox = %sandbox, error = %e, "skipping malformed runner event");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(sandbox = %sandbox, error = %e, "failed to read runner output");
                    break;
                }
            }
        }
    }
    match child.wait().await {
        Ok(status) if !status.success() => {
            tracing::warn!(sandbox = %sandbox, status = %status, "runner exited unsuccessfully");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(sandbox = %sandbox, error = %e, "failed to reap runner"),
    }
}

async fn pump_log_batches(
    sandbox: String,
    service: String,
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<Result<LogBatch, RunnerError>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = tx.closed() => {
                let _ = child.kill().await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let batch = serde_json::from_str::<LogBatch>(&line).map_err(|e| RunnerError::Logs {
                        name: sandbox.clone(),
                        service: service.clone(),
                        message: format!("malformed log batch: {}", e),
                    });
                    if tx.send(batch).await.is_err() {
                        let _ = child.kill().await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx
                        .send(Err(RunnerError::Logs {
                            name: sandbox.clone(),
                            service: service.clone(),
                            message: e.to_string(),
                        }))
                        .await;
                    break;
                }
            }
        }
    }
    let _ = child.wait().await;
}

async fn forward_stderr(context: String, stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(command = %context, "runner: {}", line);
    }
}
