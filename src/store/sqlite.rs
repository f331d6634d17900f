use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;
use super::{PrefixDefaults, PrefixStore};
use crate::audit::{AuditSink, LogOutcome, SerialLogEntry};

const RECORD_COLUMNS: &str = "prefix, digits, last_number, has_space, status, remarks, updated_at";

/// Async-safe handle to the prefix database.
///
/// Wraps `PrefixDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<PrefixDb>>,
}

impl SqliteStore {
    pub fn new(db: PrefixDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path, defaults: PrefixDefaults) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }
        Ok(Self::new(PrefixDb::new(path, defaults)?))
    }

    pub fn in_memory(defaults: PrefixDefaults) -> Result<Self> {
        Ok(Self::new(PrefixDb::new_in_memory(defaults)?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PrefixDb) -> Result<R> + Send + 'static,
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

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PrefixDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

#[async_trait]
impl PrefixStore for SqliteStore {
    async fn get(&self, prefix: &str) -> Result<Option<PrefixRecord>> {
        let prefix = prefix.to_string();
        self.call(move |db| db.get_prefix(&prefix)).await
    }

    async fn upsert(&self, prefix: &str, fields: PrefixFields) -> Result<PrefixRecord> {
        let prefix = prefix.to_string();
        self.call(move |db| db.upsert_prefix(&prefix, &fields)).await
    }

    async fn list(&self, status: PrefixStatus) -> Result<Vec<PrefixRecord>> {
        self.call(move |db| db.list_by_status(status)).await
    }

    async fn list_all(&self) -> Result<Vec<PrefixRecord>> {
        self.call(|db| db.list_prefixes()).await
    }

    async fn atomic_increment(
        &self,
        prefix: &str,
        digits: Option<u32>,
        has_space: Option<bool>,
    ) -> Result<PrefixRecord> {
        let prefix = prefix.to_string();
        self.call(move |db| db.increment(&prefix, digits, has_space))
            .await
    }

    async fn compare_and_update(
        &self,
        prefix: &str,
        expected_last_number: u64,
        fields: PrefixFields,
    ) -> Result<Option<PrefixRecord>> {
        let prefix = prefix.to_string();
        self.call(move |db| db.compare_and_update(&prefix, expected_last_number, &fields))
            .await
    }

    async fn transition_status(
        &self,
        prefix: &str,
        from: PrefixStatus,
        to: PrefixStatus,
    ) -> Result<bool> {
        let prefix = prefix.to_string();
        self.call(move |db| db.transition_status(&prefix, from, to))
            .await
    }

    async fn release(&self, prefix: &str) -> Result<Option<PrefixRecord>> {
        let prefix = prefix.to_string();
        self.call(move |db| db.release(&prefix)).await
    }

    async fn migrate_legacy_statuses(&self) -> Result<Vec<String>> {
        self.call(|db| db.migrate_legacy_statuses()).await
    }

    async fn reset_completed(&self) -> Result<Vec<String>> {
        self.call(|db| db.reset_completed()).await
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn append(&self, entry: SerialLogEntry) -> Result<Uuid> {
        self.call(move |db| db.append_log(&entry)).await
    }

    async fn recent(&self, prefix: &str, limit: usize) -> Result<Vec<SerialLogEntry>> {
        let prefix = prefix.to_string();
        self.call(move |db| db.recent_logs(&prefix, limit)).await
    }
}

pub struct PrefixDb {
    conn: Connection,
    defaults: PrefixDefaults,
}

impl PrefixDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path, defaults: PrefixDefaults) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn, defaults };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory(defaults: PrefixDefaults) -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn, defaults };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS prefix_metadata (
                    prefix TEXT PRIMARY KEY,
                    digits INTEGER NOT NULL DEFAULT 5 CHECK (digits BETWEEN 1 AND 12),
                    last_number INTEGER NOT NULL DEFAULT 0 CHECK (last_number >= 0),
                    has_space INTEGER NOT NULL DEFAULT 1,
                    status TEXT NOT NULL DEFAULT 'not_started',
                    remarks TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS serial_log (
                    id TEXT PRIMARY KEY,
                    prefix TEXT NOT NULL,
                    generated_id TEXT NOT NULL,
                    attribute TEXT,
                    status TEXT NOT NULL,
                    extra TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_prefix_status ON prefix_metadata(status);
                CREATE INDEX IF NOT EXISTS idx_serial_log_prefix ON serial_log(prefix, created_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn get_prefix(&self, prefix: &str) -> Result<Option<PrefixRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM prefix_metadata WHERE prefix = ?1"),
                params![prefix],
                PrefixRow::from_row,
            )
            .optional()
            .context("Failed to query prefix")?;
        row.map(PrefixRow::into_record).transpose()
    }

    pub fn list_prefixes(&self) -> Result<Vec<PrefixRecord>> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM prefix_metadata ORDER BY rowid"),
            [],
        )
    }

    pub fn list_by_status(&self, status: PrefixStatus) -> Result<Vec<PrefixRecord>> {
        // Legacy rows read as pending, so they belong to the pending listing too.
        if status == PrefixStatus::Pending {
            return Ok(self
                .list_prefixes()?
                .into_iter()
                .filter(|r| r.status == PrefixStatus::Pending)
                .collect());
        }
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM prefix_metadata WHERE lower(trim(status)) = ?1 ORDER BY rowid"
            ),
            params![status.as_str()],
        )
    }

    fn query_records<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<PrefixRecord>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare prefix query")?;
        let rows = stmt
            .query_map(params, PrefixRow::from_row)
            .context("Failed to query prefixes")?;
        let mut records = Vec::new();
        for row in rows {
            let r = row.context("Failed to read prefix row")?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    pub fn upsert_prefix(&self, prefix: &str, fields: &PrefixFields) -> Result<PrefixRecord> {
        let last_number = fields.last_number.map(to_sql_serial).transpose()?;
        let row = self
            .conn
            .query_row(
                &format!(
                    "INSERT INTO prefix_metadata (prefix, digits, last_number, has_space, status, remarks)
                     VALUES (?1, COALESCE(?2, ?7), COALESCE(?3, 0), COALESCE(?4, ?8), COALESCE(?5, 'not_started'), ?6)
                     ON CONFLICT(prefix) DO UPDATE SET
                        digits = COALESCE(?2, digits),
                        last_number = COALESCE(?3, last_number),
                        has_space = COALESCE(?4, has_space),
                        status = CASE
                            WHEN ?5 = 'not_started' AND lower(trim(status)) != 'not_started' THEN status
                            ELSE COALESCE(?5, status)
                        END,
                        remarks = COALESCE(?6, remarks),
                        updated_at = datetime('now')
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![
                    prefix,
                    fields.digits,
                    last_number,
                    fields.has_space,
                    fields.status.map(|s| s.as_str()),
                    fields.remarks,
                    self.defaults.digits,
                    self.defaults.has_space,
                ],
                PrefixRow::from_row,
            )
            .context("Failed to upsert prefix")?;
        row.into_record()
    }

    pub fn increment(
        &self,
        prefix: &str,
        digits: Option<u32>,
        has_space: Option<bool>,
    ) -> Result<PrefixRecord> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "INSERT INTO prefix_metadata (prefix, digits, last_number, has_space, status)
                     VALUES (?1, ?2, 1, ?3, 'pending')
                     ON CONFLICT(prefix) DO UPDATE SET
                        last_number = last_number + 1,
                        digits = COALESCE(?4, digits),
                        has_space = COALESCE(?5, has_space),
                        updated_at = datetime('now')
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![
                    prefix,
                    digits.unwrap_or(self.defaults.digits),
                    has_space.unwrap_or(self.defaults.has_space),
                    digits,
                    has_space,
                ],
                PrefixRow::from_row,
            )
            .context("Failed to increment prefix")?;
        row.into_record()
    }

    pub fn compare_and_update(
        &self,
        prefix: &str,
        expected_last_number: u64,
        fields: &PrefixFields,
    ) -> Result<Option<PrefixRecord>> {
        let last_number = fields.last_number.map(to_sql_serial).transpose()?;
        let row = self
            .conn
            .query_row(
                &format!(
                    "UPDATE prefix_metadata SET
                        digits = COALESCE(?3, digits),
                        last_number = COALESCE(?4, last_number),
                        has_space = COALESCE(?5, has_space),
                        status = COALESCE(?6, status),
                        remarks = COALESCE(?7, remarks),
                        updated_at = datetime('now')
                     WHERE prefix = ?1 AND last_number = ?2
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![
                    prefix,
                    to_sql_serial(expected_last_number)?,
                    fields.digits,
                    last_number,
                    fields.has_space,
                    fields.status.map(|s| s.as_str()),
                    fields.remarks,
                ],
                PrefixRow::from_row,
            )
            .optional()
            .context("Failed to run conditional prefix update")?;
        row.map(PrefixRow::into_record).transpose()
    }

    pub fn transition_status(
        &self,
        prefix: &str,
        from: PrefixStatus,
        to: PrefixStatus,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE prefix_metadata SET status = ?1, updated_at = datetime('now')
                 WHERE prefix = ?2 AND lower(trim(status)) = ?3",
                params![to.as_str(), prefix, from.as_str()],
            )
            .context("Failed to transition prefix status")?;
        Ok(changed > 0)
    }

    pub fn release(&self, prefix: &str) -> Result<Option<PrefixRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "UPDATE prefix_metadata SET
                        status = 'pending',
                        remarks = 'Stopped at ' || last_number,
                        updated_at = datetime('now')
                     WHERE prefix = ?1 AND lower(trim(status)) != 'completed'
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![prefix],
                PrefixRow::from_row,
            )
            .optional()
            .context("Failed to release prefix")?;
        row.map(PrefixRow::into_record).transpose()
    }

    pub fn migrate_legacy_statuses(&self) -> Result<Vec<String>> {
        // Safety: the SqliteStore mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let placeholders = LEGACY_STATUSES
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ");
        let migrated: Vec<String> = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT prefix FROM prefix_metadata WHERE lower(trim(status)) IN ({placeholders}) ORDER BY rowid"
                ))
                .context("Failed to prepare legacy status query")?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .context("Failed to query legacy statuses")?;
            rows.collect::<rusqlite::Result<_>>()
                .context("Failed to read legacy status row")?
        };
        // Rewrite other spellings of the stored values ("NOT_STARTED", " pending ").
        tx.execute(
            "UPDATE prefix_metadata SET status = lower(trim(status))
             WHERE status != lower(trim(status))
               AND lower(trim(status)) IN ('not_started', 'pending', 'completed')",
            [],
        )
        .context("Failed to normalize status spelling")?;
        if !migrated.is_empty() {
            tx.execute(
                &format!(
                    "UPDATE prefix_metadata SET status = 'pending', updated_at = datetime('now')
                     WHERE lower(trim(status)) IN ({placeholders})"
                ),
                [],
            )
            .context("Failed to migrate legacy statuses")?;
        }
        tx.commit().context("Failed to commit legacy migration")?;
        Ok(migrated)
    }

    pub fn reset_completed(&self) -> Result<Vec<String>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let prefixes: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT prefix FROM prefix_metadata WHERE lower(trim(status)) = 'completed' ORDER BY rowid")
                .context("Failed to prepare completed query")?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .context("Failed to query completed prefixes")?;
            rows.collect::<rusqlite::Result<_>>()
                .context("Failed to read completed prefix row")?
        };
        tx.execute(
            "UPDATE prefix_metadata SET
                status = 'pending',
                last_number = 0,
                remarks = 'Reset to PENDING for new automation cycle',
                updated_at = datetime('now')
             WHERE lower(trim(status)) = 'completed'",
            [],
        )
        .context("Failed to reset completed prefixes")?;
        tx.commit().context("Failed to commit completed reset")?;
        Ok(prefixes)
    }

    pub fn append_log(&self, entry: &SerialLogEntry) -> Result<Uuid> {
        let extra = serde_json::to_string(&entry.metadata).context("Failed to serialize log metadata")?;
        self.conn
            .execute(
                "INSERT INTO serial_log (id, prefix, generated_id, attribute, status, extra, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    entry.prefix,
                    entry.identifier,
                    entry.value,
                    entry.outcome.as_str(),
                    extra,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert serial log entry")?;
        Ok(entry.id)
    }

    pub fn recent_logs(&self, prefix: &str, limit: usize) -> Result<Vec<SerialLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, prefix, generated_id, attribute, status, extra, created_at
                 FROM serial_log WHERE prefix = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )
            .context("Failed to prepare recent_logs")?;
        let rows = stmt
            .query_map(params![prefix, limit as i64], |row| {
                Ok(LogRow {
                    id: row.get(0)?,
                    prefix: row.get(1)?,
                    identifier: row.get(2)?,
                    value: row.get(3)?,
                    outcome: row.get(4)?,
                    extra: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query serial log")?;
        let mut entries = Vec::new();
        for row in rows {
            let r = row.context("Failed to read serial log row")?;
            entries.push(r.into_entry()?);
        }
        Ok(entries)
    }

    /// Write a raw status string, bypassing normalization. Used to seed
    /// rows from older deployments in tests and imports.
    pub fn set_raw_status(&self, prefix: &str, raw: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE prefix_metadata SET status = ?1 WHERE prefix = ?2",
                params![raw, prefix],
            )
            .context("Failed to write raw status")?;
        Ok(())
    }
}

fn to_sql_serial(n: u64) -> Result<i64> {
    i64::try_from(n).context("Serial number exceeds storage range")
}

struct PrefixRow {
    prefix: String,
    digits: u32,
    last_number: i64,
    has_space: bool,
    status: String,
    remarks: Option<String>,
    updated_at: String,
}

impl PrefixRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            prefix: row.get(0)?,
            digits: row.get(1)?,
            last_number: row.get(2)?,
            has_space: row.get(3)?,
            status: row.get(4)?,
            remarks: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<PrefixRecord> {
        let status = PrefixStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        let last_number = u64::try_from(self.last_number)
            .with_context(|| format!("Negative last_number for {}", self.prefix))?;
        Ok(PrefixRecord {
            prefix: self.prefix,
            digits: self.digits,
            last_number,
            has_space: self.has_space,
            status,
            remarks: self.remarks,
            updated_at: self.updated_at,
        })
    }
}

struct LogRow {
    id: String,
    prefix: String,
    identifier: String,
    value: Option<String>,
    outcome: String,
    extra: String,
    created_at: String,
}

impl LogRow {
    fn into_entry(self) -> Result<SerialLogEntry> {
        Ok(SerialLogEntry {
            id: Uuid::parse_str(&self.id).context("Invalid serial log id")?,
            prefix: self.prefix,
            identifier: self.identifier,
            value: self.value,
            outcome: LogOutcome::from_str(&self.outcome).map_err(|e| anyhow::anyhow!(e))?,
            metadata: serde_json::from_str(&self.extra).unwrap_or_default(),
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .context("Invalid serial log timestamp")?
                .with_timezone(&Utc),
        })
    }
}
