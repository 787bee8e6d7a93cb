// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Container-sync bookkeeping.
//!
//! Containers with a cross-region sync target are recorded in a small SQLite
//! table so the sync daemon can find them without walking every database.
//! The replicator refreshes an entry after each broker it replicates and
//! removes it before a broker is deleted.
//!
//! Both calls are best effort from the replicator's point of view: a failure
//! is logged and the pass carries on.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the sync daemon reads the
//! table while we write it. Writes retry with exponential backoff
//! (10ms doubling to 500ms, 5 attempts).

use crate::broker::Broker;
use crate::config::SyncStoreConfig;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Boxed future returned by sync store calls.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Where containers with a sync target are tracked.
pub trait SyncStore: Send + Sync {
    /// Record or forget `broker` depending on whether it still syncs.
    ///
    /// Deleted containers and containers without a target are removed.
    fn update_sync_store<'a>(&'a self, broker: &'a dyn Broker) -> StoreFuture<'a, ()>;

    /// Forget `broker`, ahead of its deletion.
    fn remove_synced_container<'a>(&'a self, broker: &'a dyn Broker) -> StoreFuture<'a, ()>;
}

/// Store that tracks nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSyncStore;

impl SyncStore for NoOpSyncStore {
    fn update_sync_store<'a>(&'a self, _broker: &'a dyn Broker) -> StoreFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn remove_synced_container<'a>(&'a self, _broker: &'a dyn Broker) -> StoreFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::sync_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                crate::metrics::record_sync_store_error(operation_name);
                return Err(e);
            }
        }
    }
}

/// A tracked container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub db_file: String,
    pub account: String,
    pub container: String,
    pub sync_to: String,
    /// Unix millis of the last refresh.
    pub updated_at: i64,
}

/// Sync store backed by SQLite.
pub struct SqliteSyncStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteSyncStore {
    /// Open (creating if needed) the store described by `config`.
    pub async fn open(config: &SyncStoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        let in_memory = path == ":memory:";
        info!(path = %path, "Initializing container sync store");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let journal = if config.wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        // An in-memory database lives and dies with its single connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS synced_containers (
                db_file TEXT PRIMARY KEY,
                account TEXT NOT NULL,
                container TEXT NOT NULL,
                sync_to TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    /// Record `db_file` as syncing to `sync_to`.
    pub async fn upsert(&self, db_file: &str, account: &str, container: &str, sync_to: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        execute_with_retry("sync_store_upsert", || async {
            sqlx::query(
                r#"
                INSERT INTO synced_containers (db_file, account, container, sync_to, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(db_file) DO UPDATE SET
                    sync_to = excluded.sync_to,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(db_file)
            .bind(account)
            .bind(container)
            .bind(sync_to)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        debug!(db_file = %db_file, sync_to = %sync_to, "Recorded synced container");
        Ok(())
    }

    /// Forget `db_file`. Returns whether an entry existed.
    pub async fn remove(&self, db_file: &str) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry("sync_store_remove", || async {
            sqlx::query("DELETE FROM synced_containers WHERE db_file = ?")
                .bind(db_file)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, db_file: &str) -> Result<Option<SyncEntry>> {
        let row: Option<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT db_file, account, container, sync_to, updated_at FROM synced_containers WHERE db_file = ?",
        )
        .bind(db_file)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Self::entry))
    }

    /// Every tracked container, by path.
    pub async fn entries(&self) -> Result<Vec<SyncEntry>> {
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT db_file, account, container, sync_to, updated_at FROM synced_containers ORDER BY db_file",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Self::entry).collect())
    }

    fn entry((db_file, account, container, sync_to, updated_at): (String, String, String, String, i64)) -> SyncEntry {
        SyncEntry {
            db_file,
            account,
            container,
            sync_to,
            updated_at,
        }
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        let pool = &self.pool;
        let checkpoint = execute_with_retry("sync_store_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await;
        if let Err(e) = checkpoint {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Container sync store closed");
    }
}

impl SyncStore for SqliteSyncStore {
    fn update_sync_store<'a>(&'a self, broker: &'a dyn Broker) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let identity = broker.identity();
            let target = if broker.is_deleted().await? {
                None
            } else {
                broker.container_sync_to().await?.filter(|t| !t.is_empty())
            };
            match target {
                Some(sync_to) => {
                    self.upsert(&identity.db_file, &identity.account, &identity.container, &sync_to)
                        .await
                }
                None => self.remove(&identity.db_file).await.map(|_| ()),
            }
        })
    }

    fn remove_synced_container<'a>(&'a self, broker: &'a dyn Broker) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.remove(&broker.identity().db_file).await? {
                debug!(db_file = %broker.identity().db_file, "Removed synced container");
            }
            Ok(())
        })
    }
}
