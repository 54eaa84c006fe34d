//! Persistent store for agent registrations and summary history.
//!
//! The engine only depends on the [`SummaryStore`] capability. [`SqliteStore`]
//! is the production implementation; [`InMemoryStore`] backs tests and dry runs
//! and can be told to fail reads or writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::types::{Agent, SummaryResult};

/// Upper bound on history rows returned by one query.
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Capability interface consumed by the summary engine.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Most recent summary for an agent, `None` when there are no rows.
    async fn get_latest_summary(&self, agent_id: &str) -> Result<Option<SummaryResult>, StoreError>;

    /// Append a summary history row.
    async fn create_summary(
        &self,
        agent_id: &str,
        summary: &str,
        delta: &str,
        fingerprint: &str,
    ) -> Result<SummaryResult, StoreError>;

    /// Summary history for an agent, newest first.
    async fn get_summary_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<SummaryResult>, StoreError>;

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError>;

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;
}

fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_HISTORY_LIMIT)
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    id                 TEXT PRIMARY KEY,
    name               TEXT NOT NULL DEFAULT '',
    project_key        TEXT,
    current_session_id TEXT,
    last_active_at     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS agent_summaries (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id               TEXT NOT NULL,
    summary                TEXT NOT NULL,
    delta                  TEXT NOT NULL,
    transcript_fingerprint TEXT NOT NULL,
    created_at             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_summaries_agent
    ON agent_summaries (agent_id, created_at);
";

const SUMMARY_COLUMNS: &str =
    "id, agent_id, summary, delta, transcript_fingerprint, created_at";

const AGENT_COLUMNS: &str = "id, name, project_key, current_session_id, last_active_at";

/// SQLite-backed store. Blocking work runs on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                message: format!("creating {}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task {
            message: format!("SQLite task join error: {e}"),
        })?
    }

    /// Insert or replace an agent registration.
    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let agent = agent.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agents (id, name, project_key, current_session_id, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    project_key = excluded.project_key,
                    current_session_id = excluded.current_session_id,
                    last_active_at = excluded.last_active_at",
                params![
                    agent.id,
                    agent.name,
                    agent.project_key,
                    agent.current_session_id,
                    agent.last_active_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Mark an agent active now, optionally switching its current session.
    pub async fn touch_agent(&self, id: &str, session_id: Option<&str>) -> Result<(), StoreError> {
        let id = id.to_string();
        let session_id = session_id.map(str::to_string);
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE agents
                 SET last_active_at = ?2,
                     current_session_id = COALESCE(?3, current_session_id)
                 WHERE id = ?1",
                params![id, Utc::now(), session_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryResult> {
    Ok(SummaryResult {
        id: Some(row.get(0)?),
        agent_id: row.get(1)?,
        summary: row.get(2)?,
        delta: row.get(3)?,
        transcript_fingerprint: row.get(4)?,
        generated_at: row.get::<_, DateTime<Utc>>(5)?,
        cost_usd: None,
        is_stale: false,
        error: None,
    })
}

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        project_key: row.get(2)?,
        current_session_id: row.get(3)?,
        last_active_at: row.get::<_, DateTime<Utc>>(4)?,
    })
}

#[async_trait]
impl SummaryStore for SqliteStore {
    async fn get_latest_summary(&self, agent_id: &str) -> Result<Option<SummaryResult>, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SUMMARY_COLUMNS} FROM agent_summaries
                 WHERE agent_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![agent_id], summary_from_row)
                .optional()?)
        })
        .await
    }

    async fn create_summary(
        &self,
        agent_id: &str,
        summary: &str,
        delta: &str,
        fingerprint: &str,
    ) -> Result<SummaryResult, StoreError> {
        let mut result = SummaryResult::new(agent_id, summary, delta, fingerprint);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agent_summaries
                    (agent_id, summary, delta, transcript_fingerprint, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    result.agent_id,
                    result.summary,
                    result.delta,
                    result.transcript_fingerprint,
                    result.generated_at
                ],
            )?;
            result.id = Some(conn.last_insert_rowid());
            Ok(result)
        })
        .await
    }

    async fn get_summary_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<SummaryResult>, StoreError> {
        let agent_id = agent_id.to_string();
        let limit = clamp_limit(limit) as i64;
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SUMMARY_COLUMNS} FROM agent_summaries
                 WHERE agent_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![agent_id, limit], summary_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], agent_from_row).optional()?)
        })
        .await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], agent_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-memory store with failure injection and write counting.
#[derive(Default)]
pub struct InMemoryStore {
    agents: Mutex<Vec<Agent>>,
    summaries: Mutex<Vec<SummaryResult>>,
    next_id: AtomicUsize,
    writes: AtomicUsize,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&self, agent: Agent) {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        agents.retain(|a| a.id != agent.id);
        agents.push(agent);
    }

    /// Seed a history row without counting it as a write.
    pub fn seed_summary(&self, mut summary: SummaryResult) {
        summary.id = Some(self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1);
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(summary);
    }

    /// Make summary queries fail with a database error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `create_summary` fail with a database error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `create_summary` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of summary queries (`get_latest_summary` / `get_summary_history`).
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Database {
                message: "injected read failure".into(),
            });
        }
        Ok(())
    }

    fn newest_first(&self, agent_id: &str) -> Vec<SummaryResult> {
        let summaries = self.summaries.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<SummaryResult> = summaries
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.generated_at.cmp(&a.generated_at).then(b.id.cmp(&a.id)));
        rows
    }
}

#[async_trait]
impl SummaryStore for InMemoryStore {
    async fn get_latest_summary(&self, agent_id: &str) -> Result<Option<SummaryResult>, StoreError> {
        self.check_reads()?;
        Ok(self.newest_first(agent_id).into_iter().next())
    }

    async fn create_summary(
        &self,
        agent_id: &str,
        summary: &str,
        delta: &str,
        fingerprint: &str,
    ) -> Result<SummaryResult, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database {
                message: "injected write failure".into(),
            });
        }
        let mut result = SummaryResult::new(agent_id, summary, delta, fingerprint);
        result.id = Some(self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1);
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }

    async fn get_summary_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<SummaryResult>, StoreError> {
        self.check_reads()?;
        let mut rows = self.newest_first(agent_id);
        rows.truncate(clamp_limit(limit));
        Ok(rows)
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        Ok(agents.iter().find(|a| a.id == id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        Ok(self
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
