use crate::geo::Coordinate;
use crate::node::{
    Capability, Connectivity, EligibilityFilter, ForwardingState, Node, NodePosition, NodeStats,
    RelayProtocol, ScanMode,
};
use crate::store::{from_millis, to_millis, Store, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Node fields with no query or atomicity requirement
#[derive(Debug, Serialize, Deserialize)]
struct NodeProfile {
    device_name: String,
    scan_mode: ScanMode,
    supported_protocols: Vec<RelayProtocol>,
    signal_strength: Option<f64>,
    max_range_m: f64,
    max_forwarding_distance_m: f64,
}

impl NodeProfile {
    fn of(node: &Node) -> Self {
        Self {
            device_name: node.device_name.clone(),
            scan_mode: node.capability.scan_mode,
            supported_protocols: node.capability.supported_protocols.clone(),
            signal_strength: node.capability.signal_strength,
            max_range_m: node.capability.max_range_m,
            max_forwarding_distance_m: node.forwarding.max_forwarding_distance_m,
        }
    }
}

/// Population summary for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounts {
    pub total: u64,
    pub active: u64,
    pub internet_connected: u64,
    pub forwarding_capable: u64,
}

impl Store {
    /// Create or update a node keyed by id.
    ///
    /// Profile, capability and policy fields are overwritten; quota
    /// counters, statistics and position history of an existing record are
    /// kept. A missing location never erases a stored one.
    pub async fn upsert_node(&self, node: &Node) -> StoreResult<()> {
        let profile = serde_json::to_string(&NodeProfile::of(node))?;
        let mut position = node.position.clone();
        position.location = None;
        let position = serde_json::to_string(&position)?;
        let location = node.position.location;

        self.bounded(async {
            sqlx::query(
                r#"
                INSERT INTO nodes (
                    node_id, profile, position, battery_level, is_scanning,
                    allows_forwarding, internet_connected, is_active, last_seen,
                    lat, lon, max_daily_forwards, max_hourly_forwards,
                    current_daily_forwards, current_hourly_forwards,
                    last_daily_reset, last_hourly_reset,
                    messages_forwarded, messages_received, messages_delivered,
                    connection_attempts, connection_successes, avg_connection_time_ms,
                    created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(node_id) DO UPDATE SET
                    profile = excluded.profile,
                    battery_level = excluded.battery_level,
                    is_scanning = excluded.is_scanning,
                    allows_forwarding = excluded.allows_forwarding,
                    internet_connected = excluded.internet_connected,
                    is_active = 1,
                    last_seen = excluded.last_seen,
                    lat = COALESCE(excluded.lat, nodes.lat),
                    lon = COALESCE(excluded.lon, nodes.lon),
                    max_daily_forwards = excluded.max_daily_forwards,
                    max_hourly_forwards = excluded.max_hourly_forwards
                "#,
            )
            .bind(&node.node_id)
            .bind(&profile)
            .bind(&position)
            .bind(node.capability.battery_level.map(i64::from))
            .bind(node.capability.is_scanning)
            .bind(node.forwarding.allows_forwarding)
            .bind(node.connectivity.internet_connected)
            .bind(node.connectivity.is_active)
            .bind(to_millis(node.connectivity.last_seen))
            .bind(location.map(|c| c.lat))
            .bind(location.map(|c| c.lon))
            .bind(i64::from(node.forwarding.max_daily_forwards))
            .bind(i64::from(node.forwarding.max_hourly_forwards))
            .bind(i64::from(node.forwarding.current_daily_forwards))
            .bind(i64::from(node.forwarding.current_hourly_forwards))
            .bind(to_millis(node.forwarding.last_daily_reset))
            .bind(to_millis(node.forwarding.last_hourly_reset))
            .bind(node.stats.messages_forwarded as i64)
            .bind(node.stats.messages_received as i64)
            .bind(node.stats.messages_delivered as i64)
            .bind(node.stats.connection_attempts as i64)
            .bind(node.stats.connection_successes as i64)
            .bind(node.stats.avg_connection_time_ms)
            .bind(to_millis(node.created_at))
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    pub async fn get_node(&self, node_id: &str) -> StoreResult<Option<Node>> {
        self.bounded(async {
            let row = sqlx::query("SELECT * FROM nodes WHERE node_id = ?")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| node_from_row(&r)).transpose()
        })
        .await
    }

    /// Nodes matching `filter`, nearest first when the filter is spatial.
    ///
    /// Flags and the bounding box are evaluated in SQL; the exact radius
    /// and recency checks run on the decoded records.
    pub async fn find_nodes(
        &self,
        filter: &EligibilityFilter,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Node>> {
        let mut sql = String::from("SELECT * FROM nodes WHERE 1 = 1");
        if filter.require_active {
            sql.push_str(" AND is_active = 1");
        }
        if filter.require_scanning {
            sql.push_str(" AND is_scanning = 1");
        }
        if filter.require_forwarding {
            sql.push_str(" AND allows_forwarding = 1");
        }
        if filter.require_internet {
            sql.push_str(" AND internet_connected = 1");
        }
        if filter.require_quota {
            sql.push_str(
                " AND current_daily_forwards < max_daily_forwards AND current_hourly_forwards < max_hourly_forwards",
            );
        }
        if filter.min_battery.is_some() {
            sql.push_str(" AND (battery_level IS NULL OR battery_level >= ?)");
        }
        if filter.seen_within.is_some() {
            sql.push_str(" AND last_seen >= ?");
        }
        let area = filter.bounding_box();
        if area.is_some() {
            sql.push_str(" AND lat BETWEEN ? AND ? AND lon BETWEEN ? AND ?");
        }
        sql.push_str(" ORDER BY last_seen DESC");

        let rows = self
            .bounded(async {
                let mut query = sqlx::query(&sql);
                if let Some(min) = filter.min_battery {
                    query = query.bind(i64::from(min));
                }
                if let Some(window) = filter.seen_within {
                    let window = chrono::Duration::from_std(window)
                        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
                    query = query.bind(to_millis(now - window));
                }
                if let Some(area) = area {
                    query = query
                        .bind(area.min_lat)
                        .bind(area.max_lat)
                        .bind(area.min_lon)
                        .bind(area.max_lon);
                }
                Ok::<_, StoreError>(query.fetch_all(&self.pool).await?)
            })
            .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            let node = node_from_row(row)?;
            if filter.matches(&node, now) {
                nodes.push(node);
            }
        }

        if let Some(near) = filter.near {
            let distance = |n: &Node| {
                n.position
                    .location
                    .map(|c| c.distance_to(&near))
                    .unwrap_or(f64::INFINITY)
            };
            nodes.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
        }
        if let Some(limit) = filter.limit {
            nodes.truncate(limit);
        }
        Ok(nodes)
    }

    /// Replace position state; the trimmed history is last-writer-wins
    pub async fn save_position(&self, node_id: &str, position: &NodePosition) -> StoreResult<bool> {
        let location = position.location;
        let mut stored = position.clone();
        stored.location = None;
        let stored = serde_json::to_string(&stored)?;

        self.bounded(async {
            let result = sqlx::query(
                "UPDATE nodes SET position = ?, lat = COALESCE(?, lat), lon = COALESCE(?, lon) WHERE node_id = ?",
            )
            .bind(&stored)
            .bind(location.map(|c| c.lat))
            .bind(location.map(|c| c.lon))
            .bind(node_id)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await
    }

    /// Clear active/internet/scanning for nodes last seen before `cutoff`
    pub async fn mark_inactive(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.bounded(async {
            let result = sqlx::query(
                r#"
                UPDATE nodes SET is_active = 0, internet_connected = 0, is_scanning = 0
                WHERE is_active = 1 AND last_seen < ?
                "#,
            )
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected())
        })
        .await
    }

    /// Atomically take one forward from the node's quota.
    ///
    /// Without `bypass_caps` the increment only happens while both counters
    /// are below their maxima. Returns whether the forward was recorded.
    pub async fn try_increment_forward(&self, node_id: &str, bypass_caps: bool) -> StoreResult<bool> {
        self.bounded(async {
            let result = sqlx::query(
                r#"
                UPDATE nodes SET
                    current_daily_forwards = current_daily_forwards + 1,
                    current_hourly_forwards = current_hourly_forwards + 1,
                    messages_forwarded = messages_forwarded + 1
                WHERE node_id = ?
                  AND (? OR (current_daily_forwards < max_daily_forwards
                             AND current_hourly_forwards < max_hourly_forwards))
                "#,
            )
            .bind(node_id)
            .bind(bypass_caps)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await
    }

    /// Undo one recorded forward whose hand-off was never persisted
    pub async fn release_forward(&self, node_id: &str) -> StoreResult<bool> {
        self.bounded(async {
            let result = sqlx::query(
                r#"
                UPDATE nodes SET
                    current_daily_forwards = MAX(current_daily_forwards - 1, 0),
                    current_hourly_forwards = MAX(current_hourly_forwards - 1, 0),
                    messages_forwarded = MAX(messages_forwarded - 1, 0)
                WHERE node_id = ?
                "#,
            )
            .bind(node_id)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await
    }

    pub async fn reset_daily_counters(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.bounded(async {
            let result = sqlx::query(
                "UPDATE nodes SET current_daily_forwards = 0, last_daily_reset = ?",
            )
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected())
        })
        .await
    }

    pub async fn reset_hourly_counters(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.bounded(async {
            let result = sqlx::query(
                "UPDATE nodes SET current_hourly_forwards = 0, last_hourly_reset = ?",
            )
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected())
        })
        .await
    }

    /// Count one connection attempt; the averaged time is last-writer-wins
    pub async fn record_connection(
        &self,
        node_id: &str,
        success: bool,
        avg_connection_time_ms: Option<f64>,
    ) -> StoreResult<bool> {
        self.bounded(async {
            let result = sqlx::query(
                r#"
                UPDATE nodes SET
                    connection_attempts = connection_attempts + 1,
                    connection_successes = connection_successes + ?,
                    avg_connection_time_ms = COALESCE(?, avg_connection_time_ms)
                WHERE node_id = ?
                "#,
            )
            .bind(i64::from(success))
            .bind(avg_connection_time_ms)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await
    }

    pub async fn record_received(&self, node_id: &str) -> StoreResult<bool> {
        self.increment_stat(node_id, "messages_received").await
    }

    pub async fn record_delivered(&self, node_id: &str) -> StoreResult<bool> {
        self.increment_stat(node_id, "messages_delivered").await
    }

    async fn increment_stat(&self, node_id: &str, column: &'static str) -> StoreResult<bool> {
        let sql = format!("UPDATE nodes SET {column} = {column} + 1 WHERE node_id = ?");
        self.bounded(async {
            let result = sqlx::query(&sql).bind(node_id).execute(&self.pool).await?;
            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await
    }

    pub async fn node_counts(&self) -> StoreResult<NodeCounts> {
        self.bounded(async {
            let row = sqlx::query(
                r#"
                SELECT
                    COUNT(*) AS total,
                    COALESCE(SUM(is_active), 0) AS active,
                    COALESCE(SUM(is_active AND internet_connected), 0) AS internet,
                    COALESCE(SUM(is_active AND is_scanning AND allows_forwarding), 0) AS forwarding
                FROM nodes
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

            Ok::<_, StoreError>(NodeCounts {
                total: row.try_get::<i64, _>("total")? as u64,
                active: row.try_get::<i64, _>("active")? as u64,
                internet_connected: row.try_get::<i64, _>("internet")? as u64,
                forwarding_capable: row.try_get::<i64, _>("forwarding")? as u64,
            })
        })
        .await
    }
}

fn node_from_row(row: &SqliteRow) -> StoreResult<Node> {
    let profile: NodeProfile = serde_json::from_str(&row.try_get::<String, _>("profile")?)?;
    let mut position: NodePosition = serde_json::from_str(&row.try_get::<String, _>("position")?)?;

    let lat: Option<f64> = row.try_get("lat")?;
    let lon: Option<f64> = row.try_get("lon")?;
    position.location = match (lat, lon) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
        _ => None,
    };

    let battery_level = row
        .try_get::<Option<i64>, _>("battery_level")?
        .map(|b| b.clamp(0, 100) as u8);

    Ok(Node {
        node_id: row.try_get("node_id")?,
        device_name: profile.device_name,
        capability: Capability {
            battery_level,
            is_scanning: row.try_get("is_scanning")?,
            scan_mode: profile.scan_mode,
            supported_protocols: profile.supported_protocols,
            signal_strength: profile.signal_strength,
            max_range_m: profile.max_range_m,
        },
        connectivity: Connectivity {
            internet_connected: row.try_get("internet_connected")?,
            last_seen: from_millis(row.try_get("last_seen")?)?,
            is_active: row.try_get("is_active")?,
        },
        forwarding: ForwardingState {
            allows_forwarding: row.try_get("allows_forwarding")?,
            max_forwarding_distance_m: profile.max_forwarding_distance_m,
            max_daily_forwards: count(row, "max_daily_forwards")? as u32,
            max_hourly_forwards: count(row, "max_hourly_forwards")? as u32,
            current_daily_forwards: count(row, "current_daily_forwards")? as u32,
            current_hourly_forwards: count(row, "current_hourly_forwards")? as u32,
            last_daily_reset: from_millis(row.try_get("last_daily_reset")?)?,
            last_hourly_reset: from_millis(row.try_get("last_hourly_reset")?)?,
        },
        stats: NodeStats {
            messages_forwarded: count(row, "messages_forwarded")?,
            messages_received: count(row, "messages_received")?,
            messages_delivered: count(row, "messages_delivered")?,
            connection_attempts: count(row, "connection_attempts")?,
            connection_successes: count(row, "connection_successes")?,
            avg_connection_time_ms: row.try_get("avg_connection_time_ms")?,
        },
        position,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn count(row: &SqliteRow, column: &str) -> StoreResult<u64> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value)
        .map_err(|_| StoreError::CorruptRecord(format!("negative {column}: {value}")))
}
