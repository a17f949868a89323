//! Durable crawl checkpoints and search cursors.
//!
//! Every identifier moves `pending -> in_progress -> completed | failed`. The
//! row is only marked `completed` after the record's data is committed, so a
//! crash leaves at worst an `in_progress` row that [`ProgressTracker::recover`]
//! puts back into the queue.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::StorageRetry;
use crate::error::IngestResult;

/// Matches the `strftime('%Y-%m-%dT%H:%M:%fZ')` defaults in the schema so
/// timestamps compare as text.
const CHECKPOINT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%.3fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Pending => "pending",
            CrawlStatus::InProgress => "in_progress",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CrawlStatus::Pending),
            "in_progress" => Ok(CrawlStatus::InProgress),
            "completed" => Ok(CrawlStatus::Completed),
            "failed" => Ok(CrawlStatus::Failed),
            other => Err(format!("unknown crawl status '{}'", other)),
        }
    }
}

/// Rows moved back to `pending` by [`ProgressTracker::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub interrupted: u64,
    pub failed: u64,
}

impl RecoverySummary {
    pub fn total(&self) -> u64 {
        self.interrupted + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// Paging position of a search query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CrawlCursor {
    pub query_key: String,
    pub cursor_offset: i64,
    pub total_found: Option<i64>,
    pub last_success_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Checkpoint {
    pub identifier: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Checkpoint {
    pub fn crawl_status(&self) -> Option<CrawlStatus> {
        self.status.parse().ok()
    }
}

#[derive(Clone)]
pub struct ProgressTracker {
    pool: SqlitePool,
    storage: StorageRetry,
}

impl ProgressTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            storage: StorageRetry::default(),
        }
    }

    pub fn with_storage_retry(mut self, storage: StorageRetry) -> Self {
        self.storage = storage;
        self
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Add identifiers as `pending`; existing rows keep their status.
    /// Returns how many were new.
    pub async fn enqueue(&self, identifiers: &[String]) -> IngestResult<u64> {
        if identifiers.is_empty() {
            return Ok(0);
        }
        let pool = &self.pool;
        let added = self
            .storage
            .run("enqueue", move || async move {
                let mut tx = pool.begin().await?;
                let mut added = 0u64;
                for identifier in identifiers {
                    added += sqlx::query("INSERT OR IGNORE INTO crawl_checkpoints (identifier) VALUES (?)")
                        .bind(identifier)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                }
                tx.commit().await?;
                Ok(added)
            })
            .await?;

        debug!(added, offered = identifiers.len(), "Enqueued identifiers");
        Ok(added)
    }

    /// Claim an identifier for processing. Returns `false` when it is already completed.
    pub async fn begin(&self, identifier: &str) -> IngestResult<bool> {
        let pool = &self.pool;
        let claimed = self
            .storage
            .run("begin", move || async move {
                let mut tx = pool.begin().await?;
                sqlx::query("INSERT OR IGNORE INTO crawl_checkpoints (identifier) VALUES (?)")
                    .bind(identifier)
                    .execute(&mut *tx)
                    .await?;
                let claimed = sqlx::query(
                    "UPDATE crawl_checkpoints SET status = 'in_progress', attempts = attempts + 1, \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                     WHERE identifier = ? AND status != 'completed'",
                )
                .bind(identifier)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                tx.commit().await?;
                Ok(claimed)
            })
            .await?;
        Ok(claimed == 1)
    }

    /// Mark an in-progress identifier completed. Call only after its data is committed.
    pub async fn complete(&self, identifier: &str) -> IngestResult<bool> {
        let pool = &self.pool;
        let updated = self
            .storage
            .run("complete", move || async move {
                sqlx::query(
                    "UPDATE crawl_checkpoints SET status = 'completed', last_error = NULL, \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), \
                        completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                     WHERE identifier = ? AND status = 'in_progress'",
                )
                .bind(identifier)
                .execute(pool)
                .await
            })
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    pub async fn fail(&self, identifier: &str, error: &str) -> IngestResult<bool> {
        let pool = &self.pool;
        let updated = self
            .storage
            .run("fail", move || async move {
                sqlx::query(
                    "UPDATE crawl_checkpoints SET status = 'failed', last_error = ?, \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                     WHERE identifier = ? AND status = 'in_progress'",
                )
                .bind(error)
                .bind(identifier)
                .execute(pool)
                .await
            })
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    /// Requeue interrupted work, and failed work when `retry_failed` is set.
    pub async fn recover(&self, retry_failed: bool) -> IngestResult<RecoverySummary> {
        let pool = &self.pool;
        let summary = self
            .storage
            .run("recover", move || async move {
                let mut tx = pool.begin().await?;
                let interrupted = sqlx::query(
                    "UPDATE crawl_checkpoints SET status = 'pending', \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                     WHERE status = 'in_progress'",
                )
                .execute(&mut *tx)
                .await?
                .rows_affected();

                let failed = if retry_failed {
                    sqlx::query(
                        "UPDATE crawl_checkpoints SET status = 'pending', \
                            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                         WHERE status = 'failed'",
                    )
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                } else {
                    0
                };

                tx.commit().await?;
                Ok(RecoverySummary { interrupted, failed })
            })
            .await?;

        if summary.total() > 0 {
            info!(interrupted = summary.interrupted, failed = summary.failed, "Recovered checkpoints");
        }
        Ok(summary)
    }

    /// Put specific identifiers back into `pending`, whatever their status.
    pub async fn force_refresh(&self, identifiers: &[String]) -> IngestResult<u64> {
        let pool = &self.pool;
        self.storage
            .run("force_refresh", move || async move {
                let mut tx = pool.begin().await?;
                let mut touched = 0u64;
                for identifier in identifiers {
                    touched += sqlx::query(
                        "INSERT INTO crawl_checkpoints (identifier) VALUES (?) \
                         ON CONFLICT(identifier) DO UPDATE SET status = 'pending', completed_at = NULL, \
                            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                    )
                    .bind(identifier)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }
                tx.commit().await?;
                Ok(touched)
            })
            .await
    }

    pub async fn force_refresh_all(&self) -> IngestResult<u64> {
        let pool = &self.pool;
        let touched = self
            .storage
            .run("force_refresh_all", move || async move {
                sqlx::query(
                    "UPDATE crawl_checkpoints SET status = 'pending', completed_at = NULL, \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                )
                .execute(pool)
                .await
            })
            .await?
            .rows_affected();
        info!(touched, "Forced refresh of all checkpoints");
        Ok(touched)
    }

    /// Requeue identifiers completed before `now - max_age`.
    pub async fn refresh_stale(&self, max_age: chrono::Duration) -> IngestResult<u64> {
        let cutoff = (chrono::Utc::now() - max_age)
            .format(CHECKPOINT_TIMESTAMP_FORMAT)
            .to_string();
        let cutoff = cutoff.as_str();
        let pool = &self.pool;
        let touched = self
            .storage
            .run("refresh_stale", move || async move {
                sqlx::query(
                    "UPDATE crawl_checkpoints SET status = 'pending', completed_at = NULL, \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                     WHERE status = 'completed' AND COALESCE(completed_at, updated_at) < ?",
                )
                .bind(cutoff)
                .execute(pool)
                .await
            })
            .await?
            .rows_affected();
        info!(touched, cutoff, "Requeued stale checkpoints");
        Ok(touched)
    }

    /// The subset of `identifiers` already completed, in the given order.
    pub async fn completed_among(&self, identifiers: &[String]) -> IngestResult<Vec<String>> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        let pool = &self.pool;
        let completed: HashSet<String> = self
            .storage
            .run("completed_among", move || async move {
                let mut tx = pool.begin().await?;
                let mut completed = HashSet::new();
                for identifier in identifiers {
                    let hit: Option<String> = sqlx::query_scalar(
                        "SELECT identifier FROM crawl_checkpoints WHERE identifier = ? AND status = 'completed'",
                    )
                    .bind(identifier)
                    .fetch_optional(&mut *tx)
                    .await?;
                    completed.extend(hit);
                }
                tx.commit().await?;
                Ok(completed)
            })
            .await?;

        Ok(identifiers
            .iter()
            .filter(|identifier| completed.contains(identifier.as_str()))
            .cloned()
            .collect())
    }

    /// Up to `limit` pending identifiers in enqueue order.
    pub async fn next_batch(&self, limit: u32) -> IngestResult<Vec<String>> {
        let pool = &self.pool;
        self.storage
            .run("next_batch", move || async move {
                sqlx::query_scalar(
                    "SELECT identifier FROM crawl_checkpoints WHERE status = 'pending' ORDER BY rowid LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(pool)
                .await
            })
            .await
    }

    pub async fn checkpoint(&self, identifier: &str) -> IngestResult<Option<Checkpoint>> {
        let pool = &self.pool;
        self.storage
            .run("checkpoint", move || async move {
                sqlx::query_as(
                    "SELECT identifier, status, attempts, last_error, updated_at, completed_at \
                     FROM crawl_checkpoints WHERE identifier = ?",
                )
                .bind(identifier)
                .fetch_optional(pool)
                .await
            })
            .await
    }

    pub async fn status(&self, identifier: &str) -> IngestResult<Option<CrawlStatus>> {
        Ok(self.checkpoint(identifier).await?.and_then(|c| c.crawl_status()))
    }

    pub async fn is_completed(&self, identifier: &str) -> IngestResult<bool> {
        Ok(self.status(identifier).await? == Some(CrawlStatus::Completed))
    }

    pub async fn counts(&self) -> IngestResult<StatusCounts> {
        let pool = &self.pool;
        let rows: Vec<(String, i64)> = self
            .storage
            .run("status_counts", move || async move {
                sqlx::query_as("SELECT status, COUNT(*) FROM crawl_checkpoints GROUP BY status")
                    .fetch_all(pool)
                    .await
            })
            .await?;

        let by_status: BTreeMap<String, i64> = rows.into_iter().collect();
        let get = |status: CrawlStatus| by_status.get(status.as_str()).copied().unwrap_or(0) as u64;
        Ok(StatusCounts {
            pending: get(CrawlStatus::Pending),
            in_progress: get(CrawlStatus::InProgress),
            completed: get(CrawlStatus::Completed),
            failed: get(CrawlStatus::Failed),
        })
    }

    // ========================================================================
    // Search cursors
    // ========================================================================

    pub async fn load_cursor(&self, query_key: &str) -> IngestResult<Option<CrawlCursor>> {
        let pool = &self.pool;
        self.storage
            .run("load_cursor", move || async move {
                sqlx::query_as(
                    "SELECT query_key, cursor_offset, total_found, last_success_at FROM crawl_cursors WHERE query_key = ?",
                )
                .bind(query_key)
                .fetch_optional(pool)
                .await
            })
            .await
    }

    pub async fn save_cursor(&self, query_key: &str, offset: u64, total_found: Option<u64>) -> IngestResult<()> {
        let pool = &self.pool;
        let offset = offset as i64;
        let total = total_found.map(|t| t as i64);
        self.storage
            .run("save_cursor", move || async move {
                sqlx::query(
                    "INSERT INTO crawl_cursors (query_key, cursor_offset, total_found) VALUES (?, ?, ?) \
                     ON CONFLICT(query_key) DO UPDATE SET cursor_offset = excluded.cursor_offset, \
                        total_found = COALESCE(excluded.total_found, total_found), \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                )
                .bind(query_key)
                .bind(offset)
                .bind(total)
                .execute(pool)
                .await
            })
            .await?;
        Ok(())
    }

    pub async fn reset_cursor(&self, query_key: &str) -> IngestResult<()> {
        let pool = &self.pool;
        self.storage
            .run("reset_cursor", move || async move {
                sqlx::query("DELETE FROM crawl_cursors WHERE query_key = ?")
                    .bind(query_key)
                    .execute(pool)
                    .await
            })
            .await?;
        Ok(())
    }

    pub async fn touch_last_success(&self, query_key: &str) -> IngestResult<()> {
        let pool = &self.pool;
        let now = chrono::Utc::now().to_rfc3339();
        let now = now.as_str();
        self.storage
            .run("touch_last_success", move || async move {
                sqlx::query(
                    "INSERT INTO crawl_cursors (query_key, last_success_at) VALUES (?, ?) \
                     ON CONFLICT(query_key) DO UPDATE SET last_success_at = excluded.last_success_at, \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                )
                .bind(query_key)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;
        Ok(())
    }
}
