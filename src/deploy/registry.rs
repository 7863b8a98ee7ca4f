//! In-process session bookkeeping.
//!
//! Groups sessions under their deployment and counts attached observers.
//! Each deployment owns a parent token; run and tail tokens are its
//! children, so stopping a deployment reaches every task working on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::errors::OrchestratorError;

struct SessionEntry {
    observers: usize,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct DeploymentEntry {
    token: CancellationToken,
    sessions: Vec<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionEntry>,
    deployments: HashMap<String, DeploymentEntry>,
}

/// Snapshot of a registered session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub observers: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries are plain data; a panic elsewhere cannot leave them half-written.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session and return its run token.
    pub fn register(
        &self,
        session_id: &str,
        deployment: &str,
    ) -> Result<CancellationToken, OrchestratorError> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(session_id) {
            return Err(OrchestratorError::BadRequest(format!(
                "Session {} already exists",
                session_id
            )));
        }
        let parent = inner.deployments.entry(deployment.to_string()).or_default();
        let run_token = parent.token.child_token();
        parent.sessions.push(session_id.to_string());
        inner.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                observers: 0,
                created_at: Utc::now(),
            },
        );
        Ok(run_token)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    /// Live sessions of a deployment with their attached observer counts.
    pub fn sessions_for(&self, deployment: &str) -> Vec<SessionInfo> {
        let inner = self.lock();
        let Some(entry) = inner.deployments.get(deployment) else {
            return Vec::new();
        };
        entry
            .sessions
            .iter()
            .filter_map(|id| {
                inner.sessions.get(id).map(|session| SessionInfo {
                    session_id: id.clone(),
                    observers: session.observers,
                    created_at: session.created_at,
                })
            })
            .collect()
    }

    /// A fresh child of the deployment token, for log tails and recorders.
    pub fn child_token(&self, deployment: &str) -> CancellationToken {
        self.lock()
            .deployments
            .entry(deployment.to_string())
            .or_default()
            .token
            .child_token()
    }

    /// Cancel every run and tail of the deployment. Sessions stay registered
    /// so observers can still replay.
    pub fn cancel_deployment(&self, deployment: &str) {
        if let Some(entry) = self.lock().deployments.get(deployment) {
            entry.token.cancel();
        }
    }

    /// Forget the deployment and its sessions. Returns the removed session ids.
    pub fn remove_deployment(&self, deployment: &str) -> Vec<String> {
        let mut inner = self.lock();
        let Some(entry) = inner.deployments.remove(deployment) else {
            return Vec::new();
        };
        entry.token.cancel();
        for session_id in &entry.sessions {
            inner.sessions.remove(session_id);
        }
        entry.sessions
    }

    /// Cancel every registered deployment (process shutdown).
    pub fn cancel_all(&self) {
        for entry in self.lock().deployments.values() {
            entry.token.cancel();
        }
    }

    /// Count an attached observer until the guard drops. Sessions known only
    /// from the durable log are not tracked.
    pub fn observe(self: &Arc<Self>, session_id: &str) -> ObserverGuard {
        if let Some(entry) = self.lock().sessions.get_mut(session_id) {
            entry.observers += 1;
        }
        ObserverGuard {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
        }
    }
}

pub struct ObserverGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.lock().sessions.get_mut(&self.session_id) {
            entry.observers = entry.observers.saturating_sub(1);
        }
    }
}
