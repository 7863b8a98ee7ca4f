//! Deployment status state machine.
//!
//! Two tracks that never mix:
//!
//! ```text
//! Pending             ──► Operational             ──► Terminated
//!                     ──► Error                   ──►
//! SubscriptionPending ──► SubscriptionOperational ──► SubscriptionTerminated
//!                     ──► SubscriptionError       ──►
//! ```
//!
//! Every write is a compare-and-set on the record version, so a writer that
//! read before a termination can never overwrite it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::{OrchestratorError, StoreError};

use super::db::{CasResult, DbHandle};
use super::models::{DeploymentRecord, DeploymentStatus};

pub const DEFAULT_CAS_RETRIES: u32 = 3;

/// Durable store of deployment records with versioned writes.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError>;

    /// Fails with `AlreadyExists` when the name is taken.
    async fn create(&self, record: &DeploymentRecord) -> Result<(), StoreError>;

    /// Write `status` if the stored version equals `expected_version`.
    ///
    /// `deletion_date = None` keeps the stored deletion date.
    async fn cas_update(
        &self,
        name: &str,
        status: DeploymentStatus,
        deletion_date: Option<DateTime<Utc>>,
        expected_version: u64,
    ) -> Result<DeploymentRecord, StoreError>;
}

// ── Stores ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryLifecycleStore {
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
}

impl MemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LifecycleStore for MemoryLifecycleStore {
    async fn get(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(deployments.get(name).cloned())
    }

    async fn create(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        if deployments.contains_key(&record.name) {
            return Err(StoreError::AlreadyExists(record.name.clone()));
        }
        deployments.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn cas_update(
        &self,
        name: &str,
        status: DeploymentStatus,
        deletion_date: Option<DateTime<Utc>>,
        expected_version: u64,
    ) -> Result<DeploymentRecord, StoreError> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let record = deployments
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                name: name.to_string(),
                expected: expected_version,
                actual: record.version,
            });
        }
        record.status = status;
        if deletion_date.is_some() {
            record.deletion_date = deletion_date;
        }
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}

/// Deployment records in the `deployments` table.
pub struct SqliteLifecycleStore {
    db: DbHandle,
}

impl SqliteLifecycleStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LifecycleStore for SqliteLifecycleStore {
    async fn get(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError> {
        let name = name.to_string();
        self.db
            .call(move |db| db.get_deployment(&name))
            .await
            .map_err(StoreError::Database)
    }

    async fn create(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        let owned = record.clone();
        let inserted = self
            .db
            .call(move |db| db.insert_deployment(&owned))
            .await
            .map_err(StoreError::Database)?;
        if inserted {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(record.name.clone()))
        }
    }

    async fn cas_update(
        &self,
        name: &str,
        status: DeploymentStatus,
        deletion_date: Option<DateTime<Utc>>,
        expected_version: u64,
    ) -> Result<DeploymentRecord, StoreError> {
        let owned = name.to_string();
        let result = self
            .db
            .call(move |db| {
                db.cas_update_deployment(&owned, status, deletion_date, expected_version)
            })
            .await
            .map_err(StoreError::Database)?;
        match result {
            CasResult::Updated(record) => Ok(record),
            CasResult::Conflict { actual } => Err(StoreError::VersionConflict {
                name: name.to_string(),
                expected: expected_version,
                actual,
            }),
            CasResult::Missing => Err(StoreError::NotFound(name.to_string())),
        }
    }
}

// ── State machine ────────────────────────────────────────────────────

/// Non-terminal outcome a run can drive a deployment to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Operational,
    Error,
}

impl Target {
    /// The concrete status on the same track as `current`.
    pub fn resolve(self, current: DeploymentStatus) -> DeploymentStatus {
        match (self, current.is_subscription()) {
            (Target::Operational, false) => DeploymentStatus::Operational,
            (Target::Operational, true) => DeploymentStatus::SubscriptionOperational,
            (Target::Error, false) => DeploymentStatus::Error,
            (Target::Error, true) => DeploymentStatus::SubscriptionError,
        }
    }
}

fn terminated_for(current: DeploymentStatus) -> DeploymentStatus {
    if current.is_subscription() {
        DeploymentStatus::SubscriptionTerminated
    } else {
        DeploymentStatus::Terminated
    }
}

/// Whether a run may move a deployment from `from` to `to`.
///
/// Pending may resolve either way; an operational deployment may still fail.
fn allowed(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    use DeploymentStatus::*;
    matches!(
        (from, to),
        (Pending, Operational)
            | (Pending, Error)
            | (Operational, Error)
            | (SubscriptionPending, SubscriptionOperational)
            | (SubscriptionPending, SubscriptionError)
            | (SubscriptionOperational, SubscriptionError)
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(DeploymentRecord),
    /// The deployment was terminated; the caller must stop.
    Aborted,
    /// Lost every compare-and-set attempt to other writers.
    LostRace,
    /// The move is not part of the state machine (e.g. `Error → Operational`).
    Rejected { current: DeploymentStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopOutcome {
    pub status: DeploymentStatus,
    /// False when the deployment already failed and its sandbox was torn down.
    pub teardown_required: bool,
    pub already_terminated: bool,
}

/// Guarded status transitions on top of a [`LifecycleStore`].
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn LifecycleStore>,
    cas_retries: u32,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn LifecycleStore>, cas_retries: u32) -> Self {
        Self { store, cas_retries }
    }

    pub async fn get(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError> {
        self.store.get(name).await
    }

    /// Create the record for a new run on the requested track.
    pub async fn begin(
        &self,
        name: &str,
        subscription: bool,
    ) -> Result<DeploymentRecord, StoreError> {
        let record = DeploymentRecord::new(name, DeploymentStatus::initial(subscription));
        self.store.create(&record).await?;
        tracing::info!(deployment = %name, status = %record.status, "deployment created");
        Ok(record)
    }

    /// The record of a deployment that exists and is not terminated.
    pub async fn require_live(&self, name: &str) -> Result<DeploymentRecord, OrchestratorError> {
        match self.store.get(name).await? {
            Some(record) if !record.status.is_terminated() => Ok(record),
            Some(_) => Err(OrchestratorError::BadRequest(format!(
                "Deployment {} is terminated",
                name
            ))),
            None => Err(OrchestratorError::DeploymentNotFound(name.to_string())),
        }
    }

    /// True when the deployment is gone or terminated.
    pub async fn is_terminated(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(name)
            .await?
            .is_none_or(|record| record.status.is_terminated()))
    }

    pub async fn transition(
        &self,
        name: &str,
        target: Target,
        deletion_date: Option<DateTime<Utc>>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut conflicts = 0;
        loop {
            let record = self
                .store
                .get(name)
                .await?
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            if record.status.is_terminated() {
                tracing::debug!(deployment = %name, "transition aborted, deployment terminated");
                return Ok(TransitionOutcome::Aborted);
            }
            if conflicts > self.cas_retries {
                tracing::warn!(deployment = %name, attempts = conflicts, "transition lost race");
                return Ok(TransitionOutcome::LostRace);
            }

            let status = target.resolve(record.status);
            if !allowed(record.status, status) {
                return Ok(TransitionOutcome::Rejected {
                    current: record.status,
                });
            }

            match self
                .store
                .cas_update(name, status, deletion_date, record.version)
                .await
            {
                Ok(updated) => {
                    tracing::info!(
                        deployment = %name,
                        from = %record.status,
                        to = %updated.status,
                        version = updated.version,
                        "deployment status updated"
                    );
                    return Ok(TransitionOutcome::Applied(updated));
                }
                Err(e) if e.is_version_conflict() => {
                    conflicts += 1;
                    tracing::debug!(deployment = %name, error = %e, "retrying transition");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Terminate the deployment. Retries until the write lands.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome, StoreError> {
        loop {
            let record = self
                .store
                .get(name)
                .await?
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            if record.status.is_terminated() {
                return Ok(StopOutcome {
                    status: record.status,
                    teardown_required: false,
                    already_terminated: true,
                });
            }

            let status = terminated_for(record.status);
            let deletion_date = record.deletion_date.or_else(|| Some(Utc::now()));
            match self
                .store
                .cas_update(name, status, deletion_date, record.version)
                .await
            {
                Ok(updated) => {
                    tracing::info!(deployment = %name, from = %record.status, "deployment terminated");
                    return Ok(StopOutcome {
                        status: updated.status,
                        teardown_required: !record.status.is_error(),
                        already_terminated: false,
                    });
                }
                Err(e) if e.is_version_conflict() => tokio::task::yield_now().await,
                Err(e) => return Err(e),
            }
        }
    }
}
