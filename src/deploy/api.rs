use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, RunnerError};

use super::coordinator::RunCoordinator;
use super::gateway::{
    Gateway, INVALID_SESSION_MESSAGE, reject_socket, run_session_socket, run_tail_socket,
};
use super::lifecycle::StopOutcome;
use super::models::{
    DeploymentRecord, Event, ExecResult, JobSpec, LogEntry, RunRequest, RunTicket, ServiceInfo,
};
use super::registry::SessionInfo;
use super::tailer::{LogTailer, ServiceLogStore, TailOptions};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub coordinator: RunCoordinator,
    pub gateway: Gateway,
    pub tailer: LogTailer,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub package_url: String,
    pub params: Option<serde_json::Value>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub subscription: bool,
}

#[derive(Deserialize)]
pub struct LogRangeQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub last: Option<usize>,
}

#[derive(Deserialize)]
pub struct TailQuery {
    pub max_lines: Option<usize>,
    #[serde(default)]
    pub follow: bool,
    #[serde(default)]
    pub most_recent: bool,
    pub filter: Option<String>,
}

#[derive(Deserialize)]
pub struct ExecRequest {
    #[serde(default)]
    pub command: Vec<String>,
}

// ── Response types ────────────────────────────────────────────────────

/// A deployment record plus the sessions currently registered for it.
#[derive(Serialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub record: DeploymentRecord,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Serialize)]
pub struct RecordResponse {
    pub deployment: String,
    pub service: String,
    pub started: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let msg = err.to_string();
        match err {
            OrchestratorError::SessionNotFound(_) | OrchestratorError::DeploymentNotFound(_) => {
                ApiError::NotFound(msg)
            }
            OrchestratorError::DeploymentExists(_) => ApiError::Conflict(msg),
            OrchestratorError::BadRequest(_) => ApiError::BadRequest(msg),
            OrchestratorError::ShuttingDown => ApiError::Unavailable(msg),
            OrchestratorError::Runner(RunnerError::ServiceNotFound { .. }) => {
                ApiError::NotFound(msg)
            }
            OrchestratorError::Store(_) | OrchestratorError::Runner(_) => {
                tracing::error!(error = %msg, "request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/deployments/{name}", get(get_deployment))
        .route("/api/deployments/{name}/runs", post(start_run))
        .route("/api/deployments/{name}/stop", post(stop_deployment))
        .route("/api/deployments/{name}/services", get(list_services))
        .route(
            "/api/deployments/{name}/services/{service}/exec",
            post(exec_in_service),
        )
        .route(
            "/api/deployments/{name}/services/{service}/logs",
            get(get_service_logs),
        )
        .route(
            "/api/deployments/{name}/services/{service}/logs/record",
            post(record_service_logs),
        )
        .route("/api/sessions/{id}/events", get(get_session_events))
        .route("/ws/sessions/{id}", get(attach_session))
        .route(
            "/ws/deployments/{name}/services/{service}/logs",
            get(tail_service_logs),
        )
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn start_run(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunTicket>), ApiError> {
    let request = RunRequest {
        deployment: name,
        session_id: req.session_id,
        job: JobSpec {
            package_url: req.package_url,
            params: req
                .params
                .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
        },
        subscription: req.subscription,
    };
    let ticket = state.coordinator.start_run(request).await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

async fn get_deployment(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<DeploymentView>, ApiError> {
    let record = state
        .coordinator
        .lifecycle()
        .get(&name)
        .await
        .map_err(OrchestratorError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("Deployment {} not found", name)))?;
    Ok(Json(DeploymentView {
        sessions: state.coordinator.sessions(&name),
        record,
    }))
}

async fn list_services(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ServiceInfo>>, ApiError> {
    Ok(Json(state.coordinator.services(&name).await?))
}

/// Runs to completion; a non-zero exit code is still a 200.
async fn exec_in_service(
    State(state): State<SharedState>,
    Path((name, service)): Path<(String, String)>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecResult>, ApiError> {
    Ok(Json(
        state
            .coordinator
            .exec(&name, &service, &req.command)
            .await?,
    ))
}

async fn stop_deployment(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<StopOutcome>, ApiError> {
    Ok(Json(state.coordinator.stop(&name).await?))
}

async fn get_session_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Event>>, ApiError> {
    Ok(Json(state.gateway.snapshot(&id).await?))
}

/// Unknown sessions still get an upgrade so the client sees the reason.
async fn attach_session(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Response {
    match state.gateway.attach(&id).await {
        Ok(attachment) => ws.on_upgrade(move |socket| run_session_socket(socket, attachment)),
        Err(OrchestratorError::SessionNotFound(_)) => {
            ws.on_upgrade(|socket| reject_socket(socket, INVALID_SESSION_MESSAGE))
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// `?last=N` wins over `?start&end`; both default to the whole log.
async fn get_service_logs(
    State(state): State<SharedState>,
    Path((name, service)): Path<(String, String)>,
    Query(query): Query<LogRangeQuery>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    if state
        .coordinator
        .lifecycle()
        .get(&name)
        .await
        .map_err(OrchestratorError::from)?
        .is_none()
    {
        return Err(ApiError::NotFound(format!("Deployment {} not found", name)));
    }

    let store = state.tailer.store();
    let entries = match query.last {
        Some(n) => store.last(&name, &service, n).await,
        None => {
            store
                .range(
                    &name,
                    &service,
                    query.start.unwrap_or(0),
                    query.end.unwrap_or(-1),
                )
                .await
        }
    }
    .map_err(OrchestratorError::from)?;
    Ok(Json(entries))
}

async fn record_service_logs(
    State(state): State<SharedState>,
    Path((name, service)): Path<(String, String)>,
) -> Result<(StatusCode, Json<RecordResponse>), ApiError> {
    let started = state.tailer.record(&name, &service).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RecordResponse {
            deployment: name,
            service,
            started,
        }),
    ))
}

async fn tail_service_logs(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path((name, service)): Path<(String, String)>,
    Query(query): Query<TailQuery>,
) -> Result<Response, ApiError> {
    let options = TailOptions {
        follow: query.follow,
        most_recent_only: query.most_recent,
        max_lines: query.max_lines,
        filter: query.filter.filter(|f| !f.is_empty()),
    };
    let tail = state.tailer.tail(&name, &service, options).await?;
    Ok(ws.on_upgrade(move |socket| run_tail_socket(socket, tail)))
}
