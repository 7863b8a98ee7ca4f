use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::{DeploymentRecord, DeploymentStatus, Event, LogEntry};

/// Async-safe handle to the orchestrator database.
///
/// Wraps `DeployDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<DeployDb>>,
}

impl DbHandle {
    pub fn new(db: DeployDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DeployDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Result of a conditional deployment write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasResult {
    Updated(DeploymentRecord),
    Conflict { actual: u64 },
    Missing,
}

pub struct DeployDb {
    conn: Connection,
}

impl DeployDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS session_events (
                    session_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, seq)
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    name TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    deletion_date TEXT,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS service_logs (
                    deployment TEXT NOT NULL,
                    service TEXT NOT NULL,
                    idx INTEGER NOT NULL,
                    line TEXT NOT NULL,
                    PRIMARY KEY (deployment, service, idx)
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Session events ──────────────────────────────────────────────

    pub fn append_event(&self, session_id: &str, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event).context("Failed to encode event")?;
        self.conn
            .execute(
                "INSERT INTO session_events (session_id, seq, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, event.seq as i64, payload, event.at.to_rfc3339()],
            )
            .with_context(|| format!("Failed to append event {} for {}", event.seq, session_id))?;
        Ok(())
    }

    pub fn read_events(&self, session_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM session_events WHERE session_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            let event: Event =
                serde_json::from_str(&payload).context("Failed to decode stored event")?;
            events.push(event);
        }
        Ok(events)
    }

    pub fn delete_events(&self, session_id: &str) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "DELETE FROM session_events WHERE session_id = ?1",
                params![session_id],
            )
            .context("Failed to delete session events")?;
        Ok(n)
    }

    // ── Deployments ─────────────────────────────────────────────────

    pub fn get_deployment(&self, name: &str) -> Result<Option<DeploymentRecord>> {
        self.conn
            .query_row(
                "SELECT name, status, deletion_date, version, created_at, updated_at
                 FROM deployments WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query deployment")?
            .map(|(name, status, deletion, version, created, updated)| {
                Ok(DeploymentRecord {
                    name,
                    status: DeploymentStatus::from_str(&status).map_err(anyhow::Error::msg)?,
                    deletion_date: deletion.as_deref().map(parse_time).transpose()?,
                    version: version as u64,
                    created_at: parse_time(&created)?,
                    updated_at: parse_time(&updated)?,
                })
            })
            .transpose()
    }

    /// Insert a new deployment. Returns `false` when the name is taken.
    pub fn insert_deployment(&self, record: &DeploymentRecord) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO deployments
                 (name, status, deletion_date, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.name,
                    record.status.as_str(),
                    record.deletion_date.map(|d| d.to_rfc3339()),
                    record.version as i64,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert deployment")?;
        Ok(n == 1)
    }

    /// Write `status` only if the stored version still equals `expected_version`.
    pub fn cas_update_deployment(
        &self,
        name: &str,
        status: DeploymentStatus,
        deletion_date: Option<DateTime<Utc>>,
        expected_version: u64,
    ) -> Result<CasResult> {
        let now = Utc::now().to_rfc3339();
        let n = self
            .conn
            .execute(
                "UPDATE deployments
                 SET status = ?1,
                     deletion_date = COALESCE(?2, deletion_date),
                     version = version + 1,
                     updated_at = ?3
                 WHERE name = ?4 AND version = ?5",
                params![
                    status.as_str(),
                    deletion_date.map(|d| d.to_rfc3339()),
                    now,
                    name,
                    expected_version as i64,
                ],
            )
            .context("Failed to update deployment")?;

        match (n, self.get_deployment(name)?) {
            (1, Some(record)) => Ok(CasResult::Updated(record)),
            (_, Some(record)) => Ok(CasResult::Conflict {
                actual: record.version,
            }),
            (_, None) => Ok(CasResult::Missing),
        }
    }

    // ── Service logs ────────────────────────────────────────────────

    pub fn append_log_line(&self, deployment: &str, service: &str, line: &str) -> Result<u64> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(idx) + 1, 0) FROM service_logs
             WHERE deployment = ?1 AND service = ?2",
            params![deployment, service],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO service_logs (deployment, service, idx, line) VALUES (?1, ?2, ?3, ?4)",
            params![deployment, service, next, line],
        )
        .context("Failed to append log line")?;
        tx.commit().context("Failed to commit log line")?;
        Ok(next as u64)
    }

    pub fn count_log_lines(&self, deployment: &str, service: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM service_logs WHERE deployment = ?1 AND service = ?2",
            params![deployment, service],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Lines with `first <= idx <= last`, oldest first.
    pub fn read_log_lines(
        &self,
        deployment: &str,
        service: &str,
        first: u64,
        last: u64,
    ) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, line FROM service_logs
             WHERE deployment = ?1 AND service = ?2 AND idx >= ?3 AND idx <= ?4
             ORDER BY idx ASC",
        )?;
        let rows = stmt.query_map(
            params![deployment, service, first as i64, last as i64],
            |row| {
                Ok(LogEntry {
                    index: row.get::<_, i64>(0)? as u64,
                    line: row.get(1)?,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read log lines")
    }

    pub fn delete_log_lines(&self, deployment: &str) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "DELETE FROM service_logs WHERE deployment = ?1",
                params![deployment],
            )
            .context("Failed to delete log lines")?;
        Ok(n)
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}
