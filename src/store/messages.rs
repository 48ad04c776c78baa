use crate::message::{Message, MessageStatus};
use crate::store::{to_millis, Store, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const LIVE_STATUSES: &str = "('PENDING', 'ROUTING', 'CACHED')";

/// A message with the row version used for compare-and-set updates
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedMessage {
    pub message: Message,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub pending: u64,
    pub routing: u64,
    pub cached: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
}

impl MessageCounts {
    /// Messages still awaiting delivery
    pub fn undelivered(&self) -> u64 {
        self.pending + self.routing + self.cached
    }
}

impl Store {
    /// Insert a new message; an existing id is reported, never replaced
    pub async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let record = serde_json::to_string(message)?;
        let cached_at = serde_json::to_string(&message.cached_at)?;

        self.bounded(async {
            let result = sqlx::query(
                r#"
                INSERT INTO messages (
                    message_id, sender_id, recipient_id, status, cached_at, cache_expiry,
                    expires_at, terminal_at, created_at, updated_at, version, record
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                "#,
            )
            .bind(&message.message_id)
            .bind(&message.sender_id)
            .bind(&message.recipient_id)
            .bind(message.status.as_str())
            .bind(&cached_at)
            .bind(message.cache_expiry.map(to_millis))
            .bind(to_millis(message.expires_at))
            .bind(message.terminal_at().map(to_millis))
            .bind(to_millis(message.created_at))
            .bind(to_millis(Utc::now()))
            .bind(&record)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    Err(StoreError::DuplicateKey(message.message_id.clone()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn get_message(&self, message_id: &str) -> StoreResult<Option<VersionedMessage>> {
        self.bounded(async {
            let row = sqlx::query("SELECT record, version FROM messages WHERE message_id = ?")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| versioned_from_row(&r)).transpose()
        })
        .await
    }

    /// Write `message` only if the row is still at `expected_version`.
    /// Returns false when another writer got there first.
    pub async fn update_message(&self, message: &Message, expected_version: i64) -> StoreResult<bool> {
        let record = serde_json::to_string(message)?;
        let cached_at = serde_json::to_string(&message.cached_at)?;

        self.bounded(async {
            let result = sqlx::query(
                r#"
                UPDATE messages SET
                    status = ?, cached_at = ?, cache_expiry = ?, expires_at = ?,
                    terminal_at = ?, updated_at = ?, version = version + 1, record = ?
                WHERE message_id = ? AND version = ?
                "#,
            )
            .bind(message.status.as_str())
            .bind(&cached_at)
            .bind(message.cache_expiry.map(to_millis))
            .bind(to_millis(message.expires_at))
            .bind(message.terminal_at().map(to_millis))
            .bind(to_millis(Utc::now()))
            .bind(&record)
            .bind(&message.message_id)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await
    }

    /// Live messages addressed to `node_id` or cached at it, oldest first
    pub async fn pending_for(&self, node_id: &str) -> StoreResult<Vec<Message>> {
        let sql = format!(
            r#"
            SELECT record, version FROM messages
            WHERE status IN {LIVE_STATUSES}
              AND (recipient_id = ?
                   OR EXISTS (SELECT 1 FROM json_each(messages.cached_at) WHERE value = ?))
            ORDER BY created_at ASC
            "#
        );

        self.bounded(async {
            let rows = sqlx::query(&sql)
                .bind(node_id)
                .bind(node_id)
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(|r| versioned_from_row(r).map(|v| v.message))
                .collect::<StoreResult<Vec<_>>>()
        })
        .await
    }

    /// Live messages past retention, or cached copies past their expiry
    pub async fn expiry_candidates(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<VersionedMessage>> {
        let sql = format!(
            r#"
            SELECT record, version FROM messages
            WHERE status IN {LIVE_STATUSES}
              AND (expires_at <= ?
                   OR (status = 'CACHED' AND cache_expiry IS NOT NULL AND cache_expiry <= ?))
            ORDER BY expires_at ASC
            LIMIT ?
            "#
        );

        self.bounded(async {
            let rows = sqlx::query(&sql)
                .bind(to_millis(now))
                .bind(to_millis(now))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(versioned_from_row)
                .collect::<StoreResult<Vec<_>>>()
        })
        .await
    }

    /// Physically delete terminal messages older than `cutoff`
    pub async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.bounded(async {
            let result = sqlx::query(
                "DELETE FROM messages WHERE terminal_at IS NOT NULL AND terminal_at < ?",
            )
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected())
        })
        .await
    }

    pub async fn message_counts(&self) -> StoreResult<MessageCounts> {
        self.bounded(async {
            let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM messages GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

            let mut counts = MessageCounts::default();
            for row in rows {
                let status: String = row.try_get("status")?;
                let n = row.try_get::<i64, _>("n")?.max(0) as u64;
                let status = status
                    .parse::<MessageStatus>()
                    .map_err(StoreError::CorruptRecord)?;
                match status {
                    MessageStatus::Pending => counts.pending = n,
                    MessageStatus::Routing => counts.routing = n,
                    MessageStatus::Cached => counts.cached = n,
                    MessageStatus::Delivered => counts.delivered = n,
                    MessageStatus::Failed => counts.failed = n,
                    MessageStatus::Expired => counts.expired = n,
                }
            }
            Ok::<_, StoreError>(counts)
        })
        .await
    }
}

fn versioned_from_row(row: &SqliteRow) -> StoreResult<VersionedMessage> {
    let message: Message = serde_json::from_str(&row.try_get::<String, _>("record")?)?;
    Ok(VersionedMessage {
        message,
        version: row.try_get("version")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;

    fn message(id: &str, recipient: &str) -> Message {
        let now = Utc::now();
        Message::new(
            id.into(),
            NewMessage {
                sender_id: "alice".into(),
                recipient_id: recipient.into(),
                content: "hello".into(),
                ..Default::default()
            },
            7,
            now,
            now + chrono::Duration::days(7),
        )
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id() {
        let store = Store::new_in_memory().await.unwrap();
        store.insert_message(&message("m1", "bob")).await.unwrap();

        let err = store.insert_message(&message("m1", "carol")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(id) if id == "m1"));

        let stored = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.message.recipient_id, "bob");
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let store = Store::new_in_memory().await.unwrap();
        store.insert_message(&message("m1", "bob")).await.unwrap();

        let VersionedMessage { mut message, version } =
            store.get_message("m1").await.unwrap().unwrap();
        message.transition(MessageStatus::Routing, Utc::now()).unwrap();

        assert!(store.update_message(&message, version).await.unwrap());
        // stale writer loses
        assert!(!store.update_message(&message, version).await.unwrap());

        let stored = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.version, version + 1);
        assert_eq!(stored.message.status, MessageStatus::Routing);
    }

    #[tokio::test]
    async fn test_pending_includes_cached_copies() {
        let store = Store::new_in_memory().await.unwrap();
        store.insert_message(&message("to-bob", "bob")).await.unwrap();

        let mut relayed = message("via-relay", "carol");
        relayed.cached_at.push("bob".into());
        store.insert_message(&relayed).await.unwrap();
        store.insert_message(&message("to-dave", "dave")).await.unwrap();

        let pending = store.pending_for("bob").await.unwrap();
        let ids: Vec<_> = pending.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"to-bob"));
        assert!(ids.contains(&"via-relay"));
    }

    #[tokio::test]
    async fn test_expiry_candidates_and_purge() {
        let store = Store::new_in_memory().await.unwrap();
        let now = Utc::now();

        let mut old = message("old", "bob");
        old.expires_at = now - chrono::Duration::minutes(1);
        store.insert_message(&old).await.unwrap();
        store.insert_message(&message("fresh", "bob")).await.unwrap();

        let candidates = store.expiry_candidates(now, 100).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].message.message_id, "old");

        let VersionedMessage { mut message, version } = candidates[0].clone();
        message.transition(MessageStatus::Expired, now).unwrap();
        store.update_message(&message, version).await.unwrap();

        assert_eq!(store.purge_terminal(now).await.unwrap(), 0);
        let purged = store
            .purge_terminal(now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        let counts = store.message_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.expired, 0);
        assert_eq!(counts.undelivered(), 1);
    }
}
