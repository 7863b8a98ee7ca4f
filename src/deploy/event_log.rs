//! Per-session append log plus publish/subscribe.
//!
//! Durability and fan-out are separate operations: callers append first and
//! publish second. Observers rely on that order (see `gateway`).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::StoreError;

use super::db::DbHandle;
use super::models::Event;

/// Live events buffered per session before a slow subscriber lags.
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, session_id: &str, event: &Event) -> Result<(), StoreError>;

    /// Every stored event of the session, in `seq` order.
    async fn read_all(&self, session_id: &str) -> Result<Vec<Event>, StoreError>;

    async fn publish(&self, session_id: &str, event: &Event) -> Result<(), StoreError>;

    async fn subscribe(&self, session_id: &str)
    -> Result<broadcast::Receiver<Event>, StoreError>;

    /// Drop the stored log and the live channel of a torn-down session.
    async fn prune(&self, session_id: &str) -> Result<(), StoreError>;
}

/// In-process fan-out keyed by session id.
pub struct Broker {
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl Broker {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, session_id: &str, event: &Event) -> Result<usize, StoreError> {
        let channels = self.channels.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(channels
            .get(session_id)
            .and_then(|tx| tx.send(event.clone()).ok())
            .unwrap_or(0))
    }

    pub fn subscribe(&self, session_id: &str) -> Result<broadcast::Receiver<Event>, StoreError> {
        let mut channels = self.channels.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.subscribe())
    }

    pub fn close(&self, session_id: &str) -> Result<(), StoreError> {
        let mut channels = self.channels.lock().map_err(|_| StoreError::LockPoisoned)?;
        channels.remove(session_id);
        Ok(())
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(SESSION_CHANNEL_CAPACITY)
    }
}

// ── In-memory ────────────────────────────────────────────────────────

/// Event log kept in process memory. Used by tests and `storage.backend = "memory"`.
#[derive(Default)]
pub struct MemoryEventLog {
    logs: Mutex<HashMap<String, Vec<Event>>>,
    broker: Broker,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            broker: Broker::new(capacity),
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, session_id: &str, event: &Event) -> Result<(), StoreError> {
        let mut logs = self.logs.lock().map_err(|_| StoreError::LockPoisoned)?;
        let log = logs.entry(session_id.to_string()).or_default();
        match log.iter().rposition(|e| e.seq < event.seq) {
            Some(pos) => log.insert(pos + 1, event.clone()),
            None => log.insert(0, event.clone()),
        }
        Ok(())
    }

    async fn read_all(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        let logs = self.logs.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(logs.get(session_id).cloned().unwrap_or_default())
    }

    async fn publish(&self, session_id: &str, event: &Event) -> Result<(), StoreError> {
        self.broker.publish(session_id, event).map(|_| ())
    }

    async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<Event>, StoreError> {
        self.broker.subscribe(session_id)
    }

    async fn prune(&self, session_id: &str) -> Result<(), StoreError> {
        {
            let mut logs = self.logs.lock().map_err(|_| StoreError::LockPoisoned)?;
            logs.remove(session_id);
        }
        self.broker.close(session_id)
    }
}

// ── SQLite ───────────────────────────────────────────────────────────

/// Durable event log: rows in `session_events`, live fan-out through a [`Broker`].
pub struct SqliteEventLog {
    db: DbHandle,
    broker: Broker,
}

impl SqliteEventLog {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            broker: Broker::default(),
        }
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, session_id: &str, event: &Event) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let event = event.clone();
        self.db
            .call(move |db| db.append_event(&session_id, &event))
            .await
            .map_err(StoreError::Database)
    }

    async fn read_all(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |db| db.read_events(&session_id))
            .await
            .map_err(StoreError::Database)
    }

    async fn publish(&self, session_id: &str, event: &Event) -> Result<(), StoreError> {
        self.broker.publish(session_id, event).map(|_| ())
    }

    async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<Event>, StoreError> {
        self.broker.subscribe(session_id)
    }

    async fn prune(&self, session_id: &str) -> Result<(), StoreError> {
        let id = session_id.to_string();
        self.db
            .call(move |db| db.delete_events(&id))
            .await
            .map_err(StoreError::Database)?;
        self.broker.close(session_id)
    }
}
