//! Persistent store
//!
//! SQLite-backed source of truth shared by every engine instance. Nodes and
//! messages keep their filterable and atomically-updated fields in columns
//! and the remainder as JSON text. Every access is bounded by a timeout.

mod error;
mod messages;
mod nodes;

pub use error::{StoreError, StoreResult};
pub use messages::{MessageCounts, VersionedMessage};
pub use nodes::NodeCounts;

use crate::config::StoreConfig;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        node_id TEXT PRIMARY KEY,
        profile TEXT NOT NULL,
        position TEXT NOT NULL,
        battery_level INTEGER,
        is_scanning INTEGER NOT NULL,
        allows_forwarding INTEGER NOT NULL,
        internet_connected INTEGER NOT NULL,
        is_active INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        lat REAL,
        lon REAL,
        max_daily_forwards INTEGER NOT NULL,
        max_hourly_forwards INTEGER NOT NULL,
        current_daily_forwards INTEGER NOT NULL DEFAULT 0,
        current_hourly_forwards INTEGER NOT NULL DEFAULT 0,
        last_daily_reset INTEGER NOT NULL,
        last_hourly_reset INTEGER NOT NULL,
        messages_forwarded INTEGER NOT NULL DEFAULT 0,
        messages_received INTEGER NOT NULL DEFAULT 0,
        messages_delivered INTEGER NOT NULL DEFAULT 0,
        connection_attempts INTEGER NOT NULL DEFAULT 0,
        connection_successes INTEGER NOT NULL DEFAULT 0,
        avg_connection_time_ms REAL NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nodes_eligible ON nodes(is_active, is_scanning, allows_forwarding)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_location ON nodes(lat, lon)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_last_seen ON nodes(last_seen)",
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        message_id TEXT PRIMARY KEY,
        sender_id TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        status TEXT NOT NULL,
        cached_at TEXT NOT NULL,
        cache_expiry INTEGER,
        expires_at INTEGER NOT NULL,
        terminal_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        version INTEGER NOT NULL,
        record TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_messages_status_expiry ON messages(status, expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_terminal ON messages(terminal_at)",
    r#"
    CREATE TABLE IF NOT EXISTS relay_seen (
        message_id TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        seen_at INTEGER NOT NULL,
        PRIMARY KEY (message_id, peer_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_relay_seen_at ON relay_seen(seen_at)",
];

/// Handle to the shared store; cheap to clone
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    timeout: Duration,
}

impl Store {
    /// Open (creating if needed) the database named in `config`
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.timeout())
            .connect_with(options)
            .await?;

        Self::with_pool(pool, config.timeout()).await
    }

    /// Private in-memory database (for testing)
    pub async fn new_in_memory() -> StoreResult<Self> {
        // one connection that never recycles, or the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool, StoreConfig::default().timeout()).await
    }

    async fn with_pool(pool: SqlitePool, timeout: Duration) -> StoreResult<Self> {
        let store = Self { pool, timeout };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Override the per-access timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one store access under the configured timeout
    pub(crate) async fn bounded<T, F>(&self, access: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, access).await {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_store_timeout();
                tracing::warn!(timeout = ?self.timeout, "store access timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    /// Check out a pooled connection and keep it, starving other callers
    #[cfg(test)]
    pub(crate) async fn hold_connection(&self) -> sqlx::pool::PoolConnection<sqlx::Sqlite> {
        self.pool.acquire().await.unwrap()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Relay dedup

    /// Record that `peer_id` handed us `message_id`; false if already seen
    pub async fn mark_seen(
        &self,
        message_id: &str,
        peer_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.bounded(async {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO relay_seen (message_id, peer_id, seen_at) VALUES (?, ?, ?)",
            )
            .bind(message_id)
            .bind(peer_id)
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await
    }

    /// Forget seen-set entries older than `cutoff`
    pub async fn purge_seen(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.bounded(async {
            let result = sqlx::query("DELETE FROM relay_seen WHERE seen_at < ?")
                .bind(to_millis(cutoff))
                .execute(&self.pool)
                .await?;
            Ok::<_, StoreError>(result.rows_affected())
        })
        .await
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::CorruptRecord(format!("timestamp out of range: {ms}")))
}
