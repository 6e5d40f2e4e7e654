use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StoreError;
use crate::models::{
    ExecutionLog, ExecutionRun, FailureReason, LogLevel, RunStatus, is_valid_transition,
};

/// Async-safe handle to the execution state store.
///
/// Wraps `ExecutionStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<ExecutionStore>>,
}

impl StoreHandle {
    pub fn new(store: ExecutionStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure against the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ExecutionStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("store task panicked")?
    }

}

/// Durable record of execution runs and their append-only logs.
pub struct ExecutionStore {
    conn: Connection,
}

impl ExecutionStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
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
                CREATE TABLE IF NOT EXISTS execution_runs (
                    id TEXT PRIMARY KEY,
                    repo_id TEXT NOT NULL,
                    feature_node_id TEXT NOT NULL,
                    suggestion_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    iteration_count INTEGER NOT NULL DEFAULT 0,
                    files_changed INTEGER NOT NULL DEFAULT 0,
                    sandbox_path TEXT,
                    branch_name TEXT,
                    pr_url TEXT,
                    failure_reason TEXT,
                    failure_message TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS execution_logs (
                    run_id TEXT NOT NULL REFERENCES execution_runs(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    step TEXT NOT NULL,
                    level TEXT NOT NULL DEFAULT 'info',
                    message TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (run_id, seq)
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON execution_runs(status);
                CREATE INDEX IF NOT EXISTS idx_logs_run ON execution_logs(run_id, seq);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Create a new run in QUEUED.
    pub fn create_run(
        &self,
        repo_id: &str,
        feature_node_id: &str,
        suggestion_id: &str,
    ) -> Result<ExecutionRun> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO execution_runs
                     (id, repo_id, feature_node_id, suggestion_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, repo_id, feature_node_id, suggestion_id, now()],
            )
            .context("Failed to insert run")?;
        self.get_run(&id)?
            .ok_or_else(|| anyhow::anyhow!("run {} vanished after insert", id))
    }

    pub fn get_run(&self, id: &str) -> Result<Option<ExecutionRun>> {
        self.conn
            .query_row(
                "SELECT id, repo_id, feature_node_id, suggestion_id, status,
                        iteration_count, files_changed, sandbox_path, branch_name,
                        pr_url, failure_reason, failure_message, created_at, updated_at
                 FROM execution_runs WHERE id = ?1",
                params![id],
                row_to_run,
            )
            .optional()
            .context("Failed to query run")
    }

    /// Transition a run to a new status, enforcing the transition table.
    ///
    /// Terminal states are immutable: any attempt to leave one fails with
    /// `StoreError::InvalidTransition`, which is how a worker discovers that
    /// its run was cancelled out from under it.
    pub fn transition(&self, id: &str, to: RunStatus) -> Result<ExecutionRun, StoreError> {
        let run = self
            .get_run(id)?
            .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })?;
        if !is_valid_transition(run.status, to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: run.status,
                to,
            });
        }
        self.conn
            .execute(
                "UPDATE execution_runs
                 SET status = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id, to.as_str(), now()],
            )
            .context("Failed to update run status")
            .map_err(StoreError::Other)?;
        self.get_run(id)?
            .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })
    }

    /// Transition to FAILED and record the reason. No-op error if the run is
    /// already terminal (e.g. a cancel won the race).
    pub fn fail_run(
        &self,
        id: &str,
        reason: FailureReason,
        message: &str,
    ) -> Result<ExecutionRun, StoreError> {
        let run = self.transition(id, RunStatus::Failed)?;
        self.conn
            .execute(
                "UPDATE execution_runs
                 SET failure_reason = ?2, failure_message = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, reason.as_str(), message, now()],
            )
            .context("Failed to record failure reason")
            .map_err(StoreError::Other)?;
        Ok(ExecutionRun {
            failure_reason: Some(reason),
            failure_message: Some(message.to_string()),
            ..run
        })
    }

    pub fn set_sandbox(&self, id: &str, sandbox_path: &str, branch_name: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE execution_runs
                 SET sandbox_path = ?2, branch_name = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, sandbox_path, branch_name, now()],
            )
            .context("Failed to set sandbox")?;
        Ok(())
    }

    pub fn set_iteration(&self, id: &str, iteration: u32) -> Result<()> {
        self.conn
            .execute(
                "UPDATE execution_runs
                 SET iteration_count = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id, iteration, now()],
            )
            .context("Failed to set iteration count")?;
        Ok(())
    }

    pub fn set_files_changed(&self, id: &str, files_changed: usize) -> Result<()> {
        self.conn
            .execute(
                "UPDATE execution_runs
                 SET files_changed = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id, files_changed as i64, now()],
            )
            .context("Failed to set files changed")?;
        Ok(())
    }

    /// Transition PUSHING -> DONE and record the change-request URL in one
    /// statement, so a run never carries a URL in any other terminal state.
    pub fn complete_run(&self, id: &str, pr_url: &str) -> Result<ExecutionRun, StoreError> {
        let run = self
            .get_run(id)?
            .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })?;
        if !is_valid_transition(run.status, RunStatus::Done) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: run.status,
                to: RunStatus::Done,
            });
        }
        self.conn
            .execute(
                "UPDATE execution_runs
                 SET status = ?2, pr_url = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, RunStatus::Done.as_str(), pr_url, now()],
            )
            .context("Failed to complete run")
            .map_err(StoreError::Other)?;
        self.get_run(id)?
            .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })
    }

    /// Append a log line. The sequence number is assigned inside the INSERT
    /// itself, so it is gapless and strictly increasing per run even though
    /// callers never see or pass a sequence.
    pub fn append_log(
        &self,
        run_id: &str,
        step: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<ExecutionLog> {
        self.conn
            .execute(
                "INSERT INTO execution_logs (run_id, seq, step, level, message, created_at)
                 SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4, ?5
                 FROM execution_logs WHERE run_id = ?1",
                params![run_id, step, level.as_str(), message, now()],
            )
            .context("Failed to append log")?;
        self.conn
            .query_row(
                "SELECT run_id, seq, step, level, message, created_at
                 FROM execution_logs
                 WHERE run_id = ?1
                 ORDER BY seq DESC LIMIT 1",
                params![run_id],
                row_to_log,
            )
            .context("Failed to read back appended log")
    }

    /// Logs with `seq > after`, oldest first, for incremental polling.
    pub fn logs_after(&self, run_id: &str, after: i64, limit: usize) -> Result<Vec<ExecutionLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, seq, step, level, message, created_at
             FROM execution_logs
             WHERE run_id = ?1 AND seq > ?2
             ORDER BY seq ASC LIMIT ?3",
        )?;
        let logs = stmt
            .query_map(params![run_id, after, limit as i64], row_to_log)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read logs")?;
        Ok(logs)
    }

    /// Runs that have not reached a terminal state.
    pub fn non_terminal_runs(&self) -> Result<Vec<ExecutionRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repo_id, feature_node_id, suggestion_id, status,
                    iteration_count, files_changed, sandbox_path, branch_name,
                    pr_url, failure_reason, failure_message, created_at, updated_at
             FROM execution_runs
             WHERE status NOT IN ('done', 'failed', 'cancelled')",
        )?;
        let runs = stmt
            .query_map([], row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read non-terminal runs")?;
        Ok(runs)
    }
}

/// RFC 3339 timestamp for created_at/updated_at columns.
fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRun> {
    let status: String = row.get(4)?;
    let failure_reason: Option<String> = row.get(10)?;
    Ok(ExecutionRun {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        feature_node_id: row.get(2)?,
        suggestion_id: row.get(3)?,
        status: RunStatus::from_str(&status).unwrap_or(RunStatus::Failed),
        iteration_count: row.get::<_, i64>(5)? as u32,
        files_changed: row.get::<_, i64>(6)? as u32,
        sandbox_path: row.get(7)?,
        branch_name: row.get(8)?,
        pr_url: row.get(9)?,
        failure_reason: failure_reason.and_then(|r| FailureReason::from_str(&r).ok()),
        failure_message: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionLog> {
    let level: String = row.get(3)?;
    Ok(ExecutionLog {
        run_id: row.get(0)?,
        seq: row.get(1)?,
        step: row.get(2)?,
        level: LogLevel::from_str(&level).unwrap_or(LogLevel::Info),
        message: row.get(4)?,
        created_at: row.get(5)?,
    })
}
