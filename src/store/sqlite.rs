//! SQLite-backed build store.
//!
//! The full record is stored as JSON next to indexed summary columns, both
//! written in one transaction, so `list` never has to decode records.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use foundry_common::{Build, BuildFilter, BuildId, BuildStatus, BuildSummary, ErrorKind, Stage};
use rusqlite::{Connection, OptionalExtension, params};

use super::BuildStore;
use crate::errors::StoreError;

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn db_err(e: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Database(e.into())
}

struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn open_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure SQLite")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS builds (
                    id TEXT PRIMARY KEY,
                    request TEXT NOT NULL,
                    status TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    finished_at TEXT,
                    total_files INTEGER NOT NULL DEFAULT 0,
                    approved_files INTEGER NOT NULL DEFAULT 0,
                    failed_files INTEGER NOT NULL DEFAULT 0,
                    error_kind TEXT,
                    record TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cancel_requests (
                    build_id TEXT PRIMARY KEY REFERENCES builds(id) ON DELETE CASCADE,
                    requested_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status);
                CREATE INDEX IF NOT EXISTS idx_builds_created ON builds(created_at);
                CREATE INDEX IF NOT EXISTS idx_builds_finished ON builds(finished_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    fn load(&self, id: BuildId) -> Result<Build, StoreError> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM builds WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let record = record.ok_or(StoreError::NotFound(id))?;
        serde_json::from_str(&record).map_err(|source| StoreError::Corrupt {
            id: id.to_string(),
            source,
        })
    }

    fn save(&mut self, build: &Build) -> Result<(), StoreError> {
        let record = serde_json::to_string(build).map_err(|source| StoreError::Serialize {
            id: build.id,
            source,
        })?;
        let summary = build.summary();

        let tx = self.conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO builds (id, request, status, stage, created_at, updated_at, finished_at,
                                 total_files, approved_files, failed_files, error_kind, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                 request = excluded.request,
                 status = excluded.status,
                 stage = excluded.stage,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at,
                 finished_at = excluded.finished_at,
                 total_files = excluded.total_files,
                 approved_files = excluded.approved_files,
                 failed_files = excluded.failed_files,
                 error_kind = excluded.error_kind,
                 record = excluded.record",
            params![
                summary.id.to_string(),
                summary.request,
                summary.status.as_str(),
                summary.stage.as_str(),
                ts(&summary.created_at),
                ts(&summary.updated_at),
                summary.finished_at.as_ref().map(ts),
                summary.total_files as i64,
                summary.approved_files as i64,
                summary.failed_files as i64,
                summary.error_kind.map(|k| k.as_str()),
                record,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn list(&self, filter: &BuildFilter) -> Result<Vec<BuildSummary>, StoreError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let status = filter.status.map(|s| s.as_str());
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, request, status, stage, created_at, updated_at, finished_at,
                        total_files, approved_files, failed_files, error_kind
                 FROM builds
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![status, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, request, status, stage, created, updated, finished, total, approved, failed, kind) =
                row.map_err(db_err)?;
            out.push(BuildSummary {
                id: BuildId::from_str(&id).map_err(|e| db_err(anyhow!(e)))?,
                request,
                status: BuildStatus::from_str(&status).map_err(|e| db_err(anyhow!(e)))?,
                stage: Stage::from_str(&stage).map_err(|e| db_err(anyhow!(e)))?,
                created_at: parse_ts(&created).map_err(db_err)?,
                updated_at: parse_ts(&updated).map_err(db_err)?,
                finished_at: finished.as_deref().map(parse_ts).transpose().map_err(db_err)?,
                total_files: total as usize,
                approved_files: approved as usize,
                failed_files: failed as usize,
                error_kind: kind
                    .as_deref()
                    .map(ErrorKind::from_str)
                    .transpose()
                    .map_err(|e| db_err(anyhow!(e)))?,
            });
        }
        Ok(out)
    }

    fn request_cancel(&self, id: BuildId) -> Result<(), StoreError> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO cancel_requests (build_id, requested_at)
                 SELECT id, ?2 FROM builds WHERE id = ?1",
                params![id.to_string(), ts(&Utc::now())],
            )
            .map_err(db_err)?;
        if inserted == 0 && !self.exists(id)? {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn exists(&self, id: BuildId) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT 1 FROM builds WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
            .map_err(db_err)
    }

    fn cancel_requested(&self, id: BuildId) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT 1 FROM cancel_requests WHERE build_id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
            .map_err(db_err)
    }

    fn delete(&self, id: BuildId) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM builds WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    fn purge_terminal_before(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<BuildId>, StoreError> {
        let tx = self.conn.transaction().map_err(db_err)?;
        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM builds
                     WHERE status IN ('completed', 'failed', 'cancelled')
                       AND finished_at IS NOT NULL
                       AND finished_at < ?1
                     ORDER BY finished_at",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![ts(&cutoff)], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };
        for id in &ids {
            tx.execute("DELETE FROM builds WHERE id = ?1", params![id])
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;

        ids.iter()
            .map(|id| BuildId::from_str(id).map_err(|e| db_err(anyhow!(e))))
            .collect()
    }
}

/// Async-safe SQLite store. All access runs on tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteBuildStore {
    inner: Arc<std::sync::Mutex<StoreDb>>,
}

impl SqliteBuildStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::wrap(StoreDb::open(path)?))
    }

    pub fn new_in_memory() -> anyhow::Result<Self> {
        Ok(Self::wrap(StoreDb::open_in_memory()?))
    }

    fn wrap(db: StoreDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut StoreDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| db_err(anyhow!("store task panicked: {}", e)))?
    }
}

#[async_trait]
impl BuildStore for SqliteBuildStore {
    async fn load(&self, id: BuildId) -> Result<Build, StoreError> {
        self.call(move |db| db.load(id)).await
    }

    async fn save(&self, build: &Build) -> Result<(), StoreError> {
        let build = build.clone();
        self.call(move |db| db.save(&build)).await
    }

    async fn list(&self, filter: &BuildFilter) -> Result<Vec<BuildSummary>, StoreError> {
        let filter = filter.clone();
        self.call(move |db| db.list(&filter)).await
    }

    async fn request_cancel(&self, id: BuildId) -> Result<(), StoreError> {
        self.call(move |db| db.request_cancel(id)).await
    }

    async fn cancel_requested(&self, id: BuildId) -> Result<bool, StoreError> {
        self.call(move |db| db.cancel_requested(id)).await
    }

    async fn delete(&self, id: BuildId) -> Result<bool, StoreError> {
        self.call(move |db| db.delete(id)).await
    }

    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildId>, StoreError> {
        self.call(move |db| db.purge_terminal_before(cutoff)).await
    }
}
