//! SQLite storage backend for Leadflow.
//!
//! Provides durable storage with full SQL query support. This is the
//! recommended storage backend for production use.
//!
//! Transactions are serialized twice over: an in-process writer lock keeps
//! this process's transactions from interleaving, and every transaction
//! opens with `BEGIN IMMEDIATE`, so writers in other processes queue on
//! SQLite's busy timeout. A wait that outlasts it is surfaced as
//! [`StorageError::Conflict`].

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use leadflow_core::{
    Assignment, AssignmentStatus, CapacityRange, HistoryEntry, Time, WorkItem, WorkItemId, Worker,
    WorkerId, WorkerLoad,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::trait_::{Result, Storage, StorageError, Transaction};

/// How long SQLite waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const WORKER_COLUMNS: &str =
    "w.id AS id, w.name AS name, w.min_sort_key AS min_sort_key, w.max_sort_key AS max_sort_key, w.created_at AS created_at";
const ASSIGNMENT_COLUMNS: &str =
    "a.id AS id, a.work_item_id AS work_item_id, a.worker_id AS worker_id, a.status AS status, a.assigned_at AS assigned_at";

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
    /// Held by every open transaction
    writer: Arc<Mutex<()>>,
}

impl SqliteStorage {
    /// Open (creating if missing) a database file.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        Self::with_pool(pool).await
    }

    /// Create an in-memory SQLite storage for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;

        // Every connection to :memory: is a separate database, so keep
        // exactly one alive for the pool's whole life.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: sqlx::SqlitePool) -> Result<Self> {
        let storage = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                min_sort_key REAL NOT NULL,
                max_sort_key REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS work_items (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                sort_key REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS assignments (
                id TEXT PRIMARY KEY,
                work_item_id TEXT NOT NULL REFERENCES work_items(id),
                worker_id TEXT NOT NULL REFERENCES workers(id),
                status TEXT NOT NULL,
                assigned_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS assignment_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                work_item_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                previous_worker_id TEXT,
                reason TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )",
            // One active assignment per work item, enforced by the store too.
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_one_active
                ON assignments(work_item_id) WHERE status = 'active'",
            "CREATE INDEX IF NOT EXISTS idx_assignments_worker ON assignments(worker_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_history_item ON assignment_history(work_item_id)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }

        Ok(())
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    type Tx = SqliteTransaction;

    async fn begin(&self) -> Result<SqliteTransaction> {
        let writer = self.writer.clone().lock_owned().await;
        // Take the write lock up front so contending writers wait on the busy
        // timeout instead of failing when a stale read snapshot upgrades.
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(db_err)?;
        debug!("sqlite transaction opened");
        Ok(SqliteTransaction { tx, _writer: writer })
    }
}

/// Transaction over [`SqliteStorage`].
///
/// Field order matters: the SQL transaction is dropped (and rolled back)
/// before the writer lock is released.
pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    _writer: OwnedMutexGuard<()>,
}

#[async_trait]
impl Transaction for SqliteTransaction {
    // === Worker operations ===

    async fn save_worker(&mut self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, name, min_sort_key, max_sort_key, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                min_sort_key = excluded.min_sort_key,
                max_sort_key = excluded.max_sort_key",
        )
        .bind(worker.id.to_string())
        .bind(worker.name.as_str())
        .bind(worker.capacity_range.min)
        .bind(worker.capacity_range.max)
        .bind(fmt_time(&worker.created_at))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn load_worker(&mut self, id: WorkerId) -> Result<Option<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers w WHERE w.id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;

        row.as_ref().map(worker_from_row).transpose()
    }

    async fn eligible_workers(&mut self, sort_key: f64) -> Result<Vec<WorkerLoad>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS}, COUNT(a.id) AS active_load
            FROM workers w
            LEFT JOIN assignments a ON a.worker_id = w.id AND a.status = 'active'
            WHERE ? BETWEEN w.min_sort_key AND w.max_sort_key
            GROUP BY w.id"
        );
        let rows = sqlx::query(&sql)
            .bind(sort_key)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;

        rows.iter().map(load_from_row).collect()
    }

    async fn worker_loads(&mut self) -> Result<Vec<WorkerLoad>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS}, COUNT(a.id) AS active_load
            FROM workers w
            LEFT JOIN assignments a ON a.worker_id = w.id AND a.status = 'active'
            GROUP BY w.id"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;

        rows.iter().map(load_from_row).collect()
    }

    // === Work item operations ===

    async fn insert_work_item(&mut self, item: &WorkItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO work_items (id, label, sort_key, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(item.id.to_string())
        .bind(item.label.as_str())
        .bind(item.sort_key)
        .bind(fmt_time(&item.created_at))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn load_work_item(&mut self, id: WorkItemId) -> Result<Option<WorkItem>> {
        let row = sqlx::query(
            "SELECT id, label, sort_key, created_at FROM work_items WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(|row| {
                Ok(WorkItem {
                    id: parse_col(row, "id")?,
                    label: get_col(row, "label")?,
                    sort_key: get_col(row, "sort_key")?,
                    created_at: time_col(row, "created_at")?,
                })
            })
            .transpose()
    }

    // === Assignment operations ===

    async fn active_assignment(&mut self, work_item_id: WorkItemId) -> Result<Option<Assignment>> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments a
            WHERE a.work_item_id = ? AND a.status = 'active'"
        );
        let row = sqlx::query(&sql)
            .bind(work_item_id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;

        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn latest_assignment(&mut self, work_item_id: WorkItemId) -> Result<Option<Assignment>> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments a
            WHERE a.work_item_id = ?
            ORDER BY a.assigned_at DESC, a.id DESC
            LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(work_item_id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;

        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn movable_assignments(
        &mut self,
        worker_id: WorkerId,
        range: CapacityRange,
        limit: u64,
    ) -> Result<Vec<Assignment>> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments a
            JOIN work_items i ON i.id = a.work_item_id
            WHERE a.worker_id = ? AND a.status = 'active'
              AND i.sort_key BETWEEN ? AND ?
            ORDER BY a.assigned_at ASC, a.id ASC
            LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id.to_string())
            .bind(range.min)
            .bind(range.max)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;

        rows.iter().map(assignment_from_row).collect()
    }

    async fn assignments_for_worker(
        &mut self,
        worker_id: WorkerId,
        status: AssignmentStatus,
    ) -> Result<Vec<Assignment>> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments a
            WHERE a.worker_id = ? AND a.status = ?
            ORDER BY a.assigned_at ASC, a.id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id.to_string())
            .bind(status.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;

        rows.iter().map(assignment_from_row).collect()
    }

    async fn save_assignment(&mut self, assignment: &Assignment) -> Result<()> {
        sqlx::query(
            "INSERT INTO assignments (id, work_item_id, worker_id, status, assigned_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                worker_id = excluded.worker_id,
                status = excluded.status,
                assigned_at = excluded.assigned_at",
        )
        .bind(assignment.id.to_string())
        .bind(assignment.work_item_id.to_string())
        .bind(assignment.worker_id.to_string())
        .bind(assignment.status.as_str())
        .bind(fmt_time(&assignment.assigned_at))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    // === History operations ===

    async fn append_history(&mut self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO assignment_history
                (id, work_item_id, worker_id, previous_worker_id, reason, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.work_item_id.to_string())
        .bind(entry.worker_id.to_string())
        .bind(entry.previous_worker_id.map(|id| id.to_string()))
        .bind(entry.reason.as_str())
        .bind(fmt_time(&entry.recorded_at))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn history(&mut self, work_item_id: WorkItemId) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, work_item_id, worker_id, previous_worker_id, reason, recorded_at
            FROM assignment_history
            WHERE work_item_id = ?
            ORDER BY recorded_at DESC, seq DESC",
        )
        .bind(work_item_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let previous: Option<String> = get_col(row, "previous_worker_id")?;
                Ok(HistoryEntry {
                    id: parse_col(row, "id")?,
                    work_item_id: parse_col(row, "work_item_id")?,
                    worker_id: parse_col(row, "worker_id")?,
                    previous_worker_id: previous.as_deref().map(parse_str::<WorkerId>).transpose()?,
                    reason: parse_col(row, "reason")?,
                    recorded_at: time_col(row, "recorded_at")?,
                })
            })
            .collect()
    }

    // === Transaction control ===

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(db_err)?;
        debug!("sqlite transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)?;
        debug!("sqlite transaction rolled back");
        Ok(())
    }
}

/// Classify a driver error. Busy and locked results mean another writer got
/// there first, so the caller may retry.
fn db_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // SQLITE_BUSY, SQLITE_LOCKED, BUSY_RECOVERY, BUSY_SNAPSHOT
            Some("5" | "6" | "261" | "517") => StorageError::Conflict(e.to_string()),
            _ => StorageError::Other(e.to_string()),
        },
        sqlx::Error::PoolTimedOut => StorageError::Timeout(e.to_string()),
        sqlx::Error::RowNotFound => StorageError::NotFound(e.to_string()),
        _ => StorageError::Other(e.to_string()),
    }
}

// Fixed-width, so text ordering matches time ordering.
fn fmt_time(t: &Time) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_col<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| StorageError::Corrupt(format!("{column}: {e}")))
}

fn parse_str<T>(s: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e: T::Err| StorageError::Corrupt(format!("{s:?}: {e}")))
}

fn parse_col<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = get_col(row, column)?;
    parse_str(&raw)
}

fn time_col(row: &SqliteRow, column: &str) -> Result<Time> {
    let raw: String = get_col(row, column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("{column}: {e}")))
}

fn worker_from_row(row: &SqliteRow) -> Result<Worker> {
    let min: f64 = get_col(row, "min_sort_key")?;
    let max: f64 = get_col(row, "max_sort_key")?;
    Ok(Worker {
        id: parse_col(row, "id")?,
        name: get_col(row, "name")?,
        capacity_range: CapacityRange::new(min, max)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?,
        created_at: time_col(row, "created_at")?,
    })
}

fn load_from_row(row: &SqliteRow) -> Result<WorkerLoad> {
    let count: i64 = get_col(row, "active_load")?;
    Ok(WorkerLoad {
        worker: worker_from_row(row)?,
        active_load: u64::try_from(count).unwrap_or_default(),
    })
}

fn assignment_from_row(row: &SqliteRow) -> Result<Assignment> {
    Ok(Assignment {
        id: parse_col(row, "id")?,
        work_item_id: parse_col(row, "work_item_id")?,
        worker_id: parse_col(row, "worker_id")?,
        status: parse_col(row, "status")?,
        assigned_at: time_col(row, "assigned_at")?,
    })
}
