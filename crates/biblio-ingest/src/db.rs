//! SQLite pool construction, embedded migrations and the storage retry helper

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::{IngestError, IngestResult};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://biblio.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let busy_timeout_ms = std::env::var("DB_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);

        Self {
            url,
            max_connections,
            busy_timeout_ms,
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Open the pool and apply pending migrations.
///
/// In-memory databases are pinned to a single connection that never expires,
/// otherwise every new connection would see an empty database.
pub async fn connect(config: &DbConfig) -> IngestResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool = if config.is_memory() {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options.journal_mode(SqliteJournalMode::Wal))
            .await?
    };

    migrate(&pool).await?;

    tracing::info!(
        url = %config.url,
        max_connections = config.max_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> IngestResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Fresh migrated in-memory database.
pub async fn memory_pool() -> IngestResult<SqlitePool> {
    connect(&DbConfig {
        url: "sqlite::memory:".to_string(),
        ..DbConfig::default()
    })
    .await
}

/// Whether a storage error is worth retrying as a unit (lock contention, pool exhaustion).
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6; extended codes share the low byte
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            matches!(primary, Some(5) | Some(6)) || db_err.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Exponential backoff for transient storage failures.
#[derive(Debug, Clone, Copy)]
pub struct StorageRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for StorageRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(1_000),
        }
    }
}

impl StorageRetry {
    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// The closure must rebuild its transaction on every call so a retry
    /// replays the whole unit.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> IngestResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        let mut delay = self.base_delay;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation = operation_name, attempt, "Storage operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if is_transient(&err) && attempt < self.max_attempts => {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(err) => {
                    if is_transient(&err) {
                        tracing::error!(operation = operation_name, attempt, error = %err, "Storage retries exhausted");
                    }
                    return Err(IngestError::Persistence(err));
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_config() {
        let config = DbConfig::default();
        assert_eq!(config.url, DEFAULT_DATABASE_URL);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(!config.is_memory());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_memory_pool_is_migrated() {
        let pool = memory_pool().await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM crawl_checkpoints")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_replays_transient_failures() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let retry = StorageRetry::default();

        let value = retry
            .run("flaky", move || async move {
                if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_failure() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let retry = StorageRetry::default();

        let result: IngestResult<()> = retry
            .run("broken", move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(sqlx::Error::RowNotFound)
            })
            .await;

        assert!(matches!(result, Err(IngestError::Persistence(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
