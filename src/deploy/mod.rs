//! Deployment session orchestrator.
//!
//! ## Overview
//!
//! A client starts a *run* for a named deployment. The orchestrator
//! provisions a sandbox through the workload runner, executes the package
//! job, translates the runner's native event stream into canonical events,
//! persists them per session and fans them out to every attached observer.
//! Late observers replay the session from the start before following live.
//! Each deployment moves through a versioned status machine that a stop
//! request can terminate at any point.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, state wiring)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ RunCoordinator::start_run()            │
//!                       │         v                                        │
//!                       │  coordinator.rs  (one task per run)              │
//!                       │    │        │              │                     │
//!                       │    │ translate()    Lifecycle::transition()      │
//!                       │    v        v              v                     │
//!                       │  runner/  translator.rs  lifecycle.rs            │
//!                       │             │                                    │
//!                       │             │ EventLog::append() + publish()     │
//!                       │             v                                    │
//!                       │  event_log.rs ──> gateway.rs (replay + live)     │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                           |
//! |-------------|----------------------------------------------------------|
//! | `models`    | Canonical `Event`, `NativeEvent`, `DeploymentStatus`     |
//! | `db`        | SQLite access via `DbHandle` (`spawn_blocking`)          |
//! | `registry`  | Live sessions, observer counts, cancellation tokens      |
//! | `tailer`    | Bounded service-log tails and durable log recording      |
//!
//! ## Typical Request Flow (start a run, watch it)
//!
//! 1. `POST /api/deployments/{name}/runs` → `RunCoordinator::start_run()`
//!    creates the `Pending` record, registers the session and returns 202.
//! 2. The run task creates the sandbox and starts the job.
//! 3. Each native event is translated; produced events get the next `seq`,
//!    are appended to the session log and published on its channel.
//! 4. `GET /ws/sessions/{id}` subscribes, replays the log, then forwards
//!    live events, skipping any `seq` already sent.
//! 5. Run completion moves the deployment to `Operational`; a failure moves
//!    it to `Error` with a deletion date and tears the sandbox down.
//! 6. `POST /api/deployments/{name}/stop` terminates the record, cancels the
//!    run and any tails, tears down and prunes the session logs.

pub mod api;
pub mod coordinator;
pub mod db;
pub mod event_log;
pub mod gateway;
pub mod lifecycle;
pub mod models;
pub mod registry;
pub mod runner;
pub mod server;
pub mod tailer;
pub mod translator;
