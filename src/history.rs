//! Sync run history stored in SQLite.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::sync::SyncStatus;

/// One row of `sync_runs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRun {
    pub id: i64,
    pub target: String,
    pub source: Option<String>,
    pub destination: String,
    pub status: SyncStatus,
    pub files_transferred: i64,
    pub bytes_transferred: i64,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Async-safe handle to the history database.
///
/// Wraps `HistoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<HistoryDb>>,
}

impl DbHandle {
    pub fn new(db: HistoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&HistoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct HistoryDb {
    conn: Connection,
}

const RUN_COLUMNS: &str = "id, target, source, destination, status, files_transferred, \
    bytes_transferred, error, started_at, completed_at";

impl HistoryDb {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sync_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    target TEXT NOT NULL,
                    source TEXT,
                    destination TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    files_transferred INTEGER NOT NULL DEFAULT 0,
                    bytes_transferred INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_sync_runs_target ON sync_runs(target);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn create_run(&self, target: &str, destination: &str) -> Result<SyncRun> {
        self.conn
            .execute(
                "INSERT INTO sync_runs (target, destination, status) VALUES (?1, ?2, 'queued')",
                params![target, destination],
            )
            .context("Failed to insert sync run")?;
        let id = self.conn.last_insert_rowid();
        self.require_run(id)
    }

    /// Move a queued run to running. Returns `None` when the run has left
    /// the queued state already (cancelled before rsync started).
    pub fn mark_running(&self, id: i64, source: &str) -> Result<Option<SyncRun>> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_runs SET status = 'running', source = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![id, source],
            )
            .context("Failed to mark sync run running")?;
        if changed == 0 {
            return Ok(None);
        }
        self.require_run(id).map(Some)
    }

    /// Cancel a run that has not started. Returns `false` when the run is
    /// no longer queued.
    pub fn cancel_queued(&self, id: i64, error: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_runs SET status = 'cancelled', error = ?2,
                 completed_at = datetime('now') WHERE id = ?1 AND status = 'queued'",
                params![id, error],
            )
            .context("Failed to cancel queued sync run")?;
        Ok(changed > 0)
    }

    /// Drop a row that never got going (its target turned out to be busy).
    pub fn delete_run(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_runs WHERE id = ?1", params![id])
            .context("Failed to delete sync run")?;
        Ok(())
    }

    pub fn finish_run(
        &self,
        id: i64,
        status: SyncStatus,
        files_transferred: i64,
        bytes_transferred: i64,
        error: Option<&str>,
    ) -> Result<SyncRun> {
        self.conn
            .execute(
                "UPDATE sync_runs SET status = ?2, files_transferred = ?3, bytes_transferred = ?4,
                 error = ?5, completed_at = datetime('now') WHERE id = ?1",
                params![id, status.as_str(), files_transferred, bytes_transferred, error],
            )
            .context("Failed to finish sync run")?;
        self.require_run(id)
    }

    pub fn get_run(&self, id: i64) -> Result<Option<SyncRun>> {
        let sql = format!("SELECT {} FROM sync_runs WHERE id = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query sync run")?;
        row.map(RunRow::into_run).transpose()
    }

    fn require_run(&self, id: i64) -> Result<SyncRun> {
        self.get_run(id)?
            .ok_or_else(|| anyhow::anyhow!("Sync run {} not found after write", id))
    }

    /// Newest first.
    pub fn list_runs(&self, limit: i64) -> Result<Vec<SyncRun>> {
        let sql = format!(
            "SELECT {} FROM sync_runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], RunRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list sync runs")?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    pub fn last_run_for_target(&self, target: &str) -> Result<Option<SyncRun>> {
        let sql = format!(
            "SELECT {} FROM sync_runs WHERE target = ?1 ORDER BY id DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![target], RunRow::from_row)
            .optional()
            .context("Failed to query last sync run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Runs still marked active from a previous process can never finish;
    /// fail them. Returns how many rows changed.
    pub fn mark_interrupted(&self) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_runs SET status = 'failed', error = 'interrupted',
                 completed_at = datetime('now') WHERE status IN ('queued', 'running')",
                [],
            )
            .context("Failed to mark interrupted runs")?;
        Ok(changed)
    }
}

struct RunRow {
    id: i64,
    target: String,
    source: Option<String>,
    destination: String,
    status: String,
    files_transferred: i64,
    bytes_transferred: i64,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target: row.get(1)?,
            source: row.get(2)?,
            destination: row.get(3)?,
            status: row.get(4)?,
            files_transferred: row.get(5)?,
            bytes_transferred: row.get(6)?,
            error: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_run(self) -> Result<SyncRun> {
        let status = self
            .status
            .parse::<SyncStatus>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(SyncRun {
            id: self.id,
            target: self.target,
            source: self.source,
            destination: self.destination,
            status,
            files_transferred: self.files_transferred,
            bytes_transferred: self.bytes_transferred,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get_run() -> Result<()> {
        let db = HistoryDb::new_in_memory()?;
        let run = db.create_run("comfy", "/media/comfy")?;
        assert_eq!(run.status, SyncStatus::Queued);
        assert_eq!(run.target, "comfy");
        assert!(run.source.is_none());
        assert_eq!(db.get_run(run.id)?, Some(run));
        assert!(db.get_run(999)?.is_none());
        Ok(())
    }

    #[test]
    fn test_run_lifecycle() -> Result<()> {
        let db = HistoryDb::new_in_memory()?;
        let run = db.create_run("forge", "/media/forge")?;
        let running = db.mark_running(run.id, "root@h:/ws/outputs/")?.unwrap();
        assert_eq!(running.status, SyncStatus::Running);
        assert_eq!(running.source.as_deref(), Some("root@h:/ws/outputs/"));

        let done = db.finish_run(run.id, SyncStatus::Completed, 12, 4096, None)?;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.files_transferred, 12);
        assert_eq!(done.bytes_transferred, 4096);
        assert!(done.completed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_cancelled_queued_run_cannot_start() -> Result<()> {
        let db = HistoryDb::new_in_memory()?;
        let run = db.create_run("comfy", "/m")?;
        assert!(db.cancel_queued(run.id, "cancelled by user")?);
        assert!(db.mark_running(run.id, "root@h:/out/")?.is_none());

        let run = db.get_run(run.id)?.unwrap();
        assert_eq!(run.status, SyncStatus::Cancelled);
        assert!(run.source.is_none());
        assert!(!db.cancel_queued(run.id, "again")?);
        Ok(())
    }

    #[test]
    fn test_cancel_queued_ignores_running_runs() -> Result<()> {
        let db = HistoryDb::new_in_memory()?;
        let run = db.create_run("comfy", "/m")?;
        db.mark_running(run.id, "src")?;
        assert!(!db.cancel_queued(run.id, "cancelled by user")?);
        assert_eq!(db.get_run(run.id)?.unwrap().status, SyncStatus::Running);
        Ok(())
    }

    #[test]
    fn test_delete_run() -> Result<()> {
        let db = HistoryDb::new_in_memory()?;
        let run = db.create_run("comfy", "/m")?;
        db.delete_run(run.id)?;
        assert!(db.get_run(run.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_runs_newest_first_with_limit() -> Result<()> {
        let db = HistoryDb::new_in_memory()?;
        for target in ["a", "b", "c"] {
            db.create_run(target, "/m")?;
        }
        let runs = db.list_runs(2)?;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].target, "c");
        assert_eq!(runs[1].target, "b");
        Ok(())
    }

    #[test]
    fn test_last_run_for_target() -> Result<()> {
        let db = HistoryDb::new_in_memory()?;
        db.create_run("a", "/m")?;
        let second = db.create_run("a", "/m")?;
        db.create_run("b", "/m")?;
        assert_eq!(db.last_run_for_target("a")?.map(|r| r.id), Some(second.id));
        assert!(db.last_run_for_target("zzz")?.is_none());
        Ok(())
    }

    #[test]
    fn test_mark_interrupted_only_touches_active_runs() -> Result<()> {
        let db = HistoryDb::new_in_memory()?;
        let queued = db.create_run("a", "/m")?;
        let running = db.create_run("b", "/m")?;
        db.mark_running(running.id, "src")?;
        let done = db.create_run("c", "/m")?;
        db.finish_run(done.id, SyncStatus::Completed, 1, 1, None)?;

        assert_eq!(db.mark_interrupted()?, 2);
        let queued = db.get_run(queued.id)?.unwrap();
        assert_eq!(queued.status, SyncStatus::Failed);
        assert_eq!(queued.error.as_deref(), Some("interrupted"));
        assert_eq!(db.get_run(done.id)?.unwrap().status, SyncStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(HistoryDb::new_in_memory()?);
        let run = handle.call(|db| db.create_run("comfy", "/m")).await?;
        let fetched = handle.call(move |db| db.get_run(run.id)).await?;
        assert_eq!(fetched.map(|r| r.target), Some("comfy".to_string()));
        Ok(())
    }
}
