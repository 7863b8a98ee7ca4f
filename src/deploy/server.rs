use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::{NetdeployConfig, RunnerKind, StorageBackend};

use super::api::{self, AppState, SharedState};
use super::coordinator::RunCoordinator;
use super::db::{DbHandle, DeployDb};
use super::event_log::{EventLog, MemoryEventLog, SqliteEventLog};
use super::gateway::Gateway;
use super::lifecycle::{Lifecycle, LifecycleStore, MemoryLifecycleStore, SqliteLifecycleStore};
use super::registry::SessionRegistry;
use super::runner::{ProcessRunner, ScriptedRunner, WorkloadRunner};
use super::tailer::{LogTailer, MemoryServiceLogStore, ServiceLogStore, SqliteServiceLogStore};

struct Stores {
    events: Arc<dyn EventLog>,
    lifecycle: Arc<dyn LifecycleStore>,
    service_logs: Arc<dyn ServiceLogStore>,
}

fn open_stores(config: &NetdeployConfig) -> Result<Stores> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Stores {
            events: Arc::new(MemoryEventLog::new()),
            lifecycle: Arc::new(MemoryLifecycleStore::new()),
            service_logs: Arc::new(MemoryServiceLogStore::new()),
        }),
        StorageBackend::Sqlite => {
            let path = &config.storage.db_path;
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
            let db = DeployDb::new(path).with_context(|| {
                format!("Failed to initialize database at {}", path.display())
            })?;
            let handle = DbHandle::new(db);
            Ok(Stores {
                events: Arc::new(SqliteEventLog::new(handle.clone())),
                lifecycle: Arc::new(SqliteLifecycleStore::new(handle.clone())),
                service_logs: Arc::new(SqliteServiceLogStore::new(handle)),
            })
        }
    }
}

fn build_runner(config: &NetdeployConfig) -> Arc<dyn WorkloadRunner> {
    match config.runner.kind {
        RunnerKind::Process => Arc::new(ProcessRunner::new(
            config.runner.command.clone(),
            config.runner.args.clone(),
        )),
        RunnerKind::Scripted => Arc::new(ScriptedRunner::demo()),
    }
}

/// Wire stores, runner and registry into the shared state.
pub fn build_state(config: &NetdeployConfig) -> Result<SharedState> {
    let stores = open_stores(config)?;
    Ok(assemble(config, stores, build_runner(config)))
}

/// Same as [`build_state`] with a caller-supplied runner.
pub fn build_state_with_runner(
    config: &NetdeployConfig,
    runner: Arc<dyn WorkloadRunner>,
) -> Result<SharedState> {
    let stores = open_stores(config)?;
    Ok(assemble(config, stores, runner))
}

fn assemble(
    config: &NetdeployConfig,
    stores: Stores,
    runner: Arc<dyn WorkloadRunner>,
) -> SharedState {
    let registry = Arc::new(SessionRegistry::new());
    let lifecycle = Lifecycle::new(stores.lifecycle, config.lifecycle.cas_retries);

    let coordinator = RunCoordinator::new(
        Arc::clone(&stores.events),
        lifecycle.clone(),
        Arc::clone(&registry),
        Arc::clone(&runner),
        Arc::clone(&stores.service_logs),
    )
    .with_prune_on_stop(config.storage.prune_on_stop);
    let gateway = Gateway::new(stores.events, Arc::clone(&registry));
    let tailer = LogTailer::new(runner, stores.service_logs, registry, lifecycle)
        .with_limits(config.logs.default_max_lines, config.logs.max_lines_cap);

    Arc::new(AppState {
        coordinator,
        gateway,
        tailer,
    })
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the orchestrator server and block until Ctrl+C.
pub async fn start_server(config: NetdeployConfig) -> Result<()> {
    let state = build_state(&config)?;

    let mut app = build_router(Arc::clone(&state));
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.bind_host(), config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        storage = ?config.storage.backend,
        runner = ?config.runner.kind,
        "netdeploy listening"
    );
    println!("netdeploy running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.coordinator.shutdown().await;
    state.tailer.shutdown().await;
    tracing::info!("all runs and tails stopped");
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::deploy::models::{DeploymentStatus, JobSpec, NativeEvent, RunRequest};

    fn memory_config() -> NetdeployConfig {
        let mut config = NetdeployConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config.runner.kind = RunnerKind::Scripted;
        config
    }

    fn test_router() -> Router {
        build_router(build_state(&memory_config()).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let request = Request::builder()
            .uri("/api/nothing-here")
            .body(Body::empty())
            .unwrap();

        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sqlite_state_persists_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NetdeployConfig::default();
        config.storage.db_path = dir.path().join("nested").join("netdeploy.db");
        let runner = Arc::new(ScriptedRunner::new(vec![NativeEvent::RunFinished {
            success: true,
            output: None,
        }]));

        let state = build_state_with_runner(&config, runner).unwrap();
        assert!(config.storage.db_path.exists());

        let request = Request::builder()
            .method("POST")
            .uri("/api/deployments/d1/runs")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"package_url": "github.com/org/pkg", "session_id": "s1"})
                    .to_string(),
            ))
            .unwrap();
        let response = build_router(Arc::clone(&state))
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        state.coordinator.drain().await;

        let db = DeployDb::new(&config.storage.db_path).unwrap();
        let record = db.get_deployment("d1").unwrap().unwrap();
        assert_eq!(record.status.as_str(), "Operational");
        assert_eq!(db.read_events("s1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_log_limits_come_from_config() {
        let mut config = memory_config();
        config.logs.default_max_lines = 7;
        config.logs.max_lines_cap = 20;
        let state = build_state(&config).unwrap();
        assert_eq!(state.tailer.effective_max_lines(None).unwrap(), 7);
        assert_eq!(state.tailer.effective_max_lines(Some(500)).unwrap(), 20);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_no_pending_record_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NetdeployConfig::default();
        config.storage.db_path = dir.path().join("netdeploy.db");
        let runner = Arc::new(
            ScriptedRunner::new(vec![NativeEvent::Progress {
                step_info: vec!["Starting".to_string()],
                current_step: 1,
                total_steps: 2,
            }])
            .hold_open(),
        );
        let state = build_state_with_runner(&config, runner).unwrap();
        state
            .coordinator
            .start_run(RunRequest {
                deployment: "d1".to_string(),
                session_id: Some("s1".to_string()),
                job: JobSpec {
                    package_url: "github.com/org/pkg".to_string(),
                    params: serde_json::json!({}),
                },
                subscription: false,
            })
            .await
            .unwrap();
        let mut waited = 0;
        while state.gateway.snapshot("s1").await.unwrap().is_empty() {
            assert!(waited < 200, "run never started streaming");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 1;
        }
        state.coordinator.shutdown().await;
        drop(state);

        let restarted =
            build_state_with_runner(&config, Arc::new(ScriptedRunner::new(Vec::new()))).unwrap();
        let record = restarted
            .coordinator
            .lifecycle()
            .get("d1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DeploymentStatus::Error);
        assert!(record.deletion_date.is_some());
        let stop = restarted.coordinator.stop("d1").await.unwrap();
        assert_eq!(stop.status, DeploymentStatus::Terminated);
        assert!(!stop.teardown_required);
    }
}
