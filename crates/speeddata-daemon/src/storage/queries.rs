//! Registry queries.
//!
//! Each call is atomic on its own; nothing here holds a transaction across
//! calls, so callers re-check conditions instead of trusting earlier reads.

use std::collections::HashSet;

use serde_json::Value;
use speeddata_core::config::BaselineChannel;
use speeddata_core::db::{is_unique_violation, unix_timestamp};
use tracing::debug;

use super::db::{Database, DatabaseError};
use super::models::{Channel, ChannelRow, ChannelStatus};

impl Database {
    /// Insert a new channel with status `registered`.
    ///
    /// Returns `Ok(false)` without side effects when the name or the port is
    /// already taken. The table constraints decide, so of two concurrent
    /// attempts on the same name or port exactly one wins.
    pub async fn register(
        &self,
        name: &str,
        port: u16,
        schema_path: &str,
        config: &Value,
    ) -> Result<bool, DatabaseError> {
        let config_json = match config {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            other => Some(serde_json::to_string(other).map_err(|e| DatabaseError::Query(e.to_string()))?),
        };

        let result = sqlx::query(
            r"
            INSERT INTO channels (name, port, schema_path, config_json, status, created_at)
            VALUES (?, ?, ?, ?, 'registered', ?)
            ",
        )
        .bind(name)
        .bind(i64::from(port))
        .bind(schema_path)
        .bind(config_json)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => {
                debug!(channel = name, port, "Channel row inserted");
                Ok(true)
            }
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a channel row. Returns whether a row existed.
    pub async fn deregister(&self, name: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM channels WHERE name = ?")
            .bind(name)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a channel by name.
    pub async fn get_channel(&self, name: &str) -> Result<Channel, DatabaseError> {
        let row = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Channel {name}")))?;

        Channel::try_from(row)
    }

    /// Get the channel holding `port`, if any.
    pub async fn get_channel_by_port(&self, port: u16) -> Result<Option<Channel>, DatabaseError> {
        let row = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE port = ?")
            .bind(i64::from(port))
            .fetch_optional(self.pool())
            .await?;

        row.map(Channel::try_from).transpose()
    }

    /// List channels in insertion order, optionally filtered by status.
    pub async fn list_channels(
        &self,
        status: Option<ChannelStatus>,
    ) -> Result<Vec<Channel>, DatabaseError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, ChannelRow>(
                "SELECT * FROM channels WHERE status = ? ORDER BY rowid ASC",
            )
            .bind(status.as_str())
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels ORDER BY rowid ASC")
                .fetch_all(self.pool())
                .await?
        };

        rows.into_iter().map(Channel::try_from).collect()
    }

    /// True when no channel, in any status, holds `port`.
    pub async fn is_port_available(&self, port: u16) -> Result<bool, DatabaseError> {
        let taken: Option<(String,)> = sqlx::query_as("SELECT name FROM channels WHERE port = ?")
            .bind(i64::from(port))
            .fetch_optional(self.pool())
            .await?;

        Ok(taken.is_none())
    }

    /// Ports in `start..=end` not held by any channel, ascending.
    pub async fn available_ports(&self, start: u16, end: u16) -> Result<Vec<u16>, DatabaseError> {
        let used: Vec<(i64,)> =
            sqlx::query_as("SELECT port FROM channels WHERE port BETWEEN ? AND ?")
                .bind(i64::from(start))
                .bind(i64::from(end))
                .fetch_all(self.pool())
                .await?;
        let used: HashSet<i64> = used.into_iter().map(|(p,)| p).collect();

        Ok((start..=end)
            .filter(|p| !used.contains(&i64::from(*p)))
            .collect())
    }

    /// Record the worker serving `name` and stamp the heartbeat.
    pub async fn update_process_info(
        &self,
        name: &str,
        pid: u32,
        status: ChannelStatus,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE channels SET pid = ?, status = ?, last_heartbeat = ? WHERE name = ?")
            .bind(i64::from(pid))
            .bind(status.as_str())
            .bind(unix_timestamp())
            .bind(name)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Detach the worker: `pid = NULL`, status back to `registered`.
    pub async fn clear_process_info(&self, name: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE channels SET pid = NULL, status = 'registered' WHERE name = ?")
            .bind(name)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Refresh `last_heartbeat` for a channel whose worker is alive.
    pub async fn touch_heartbeat(&self, name: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE channels SET last_heartbeat = ? WHERE name = ? AND status = 'active'")
            .bind(unix_timestamp())
            .bind(name)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Merge the static baseline into the registry.
    ///
    /// Only channels whose name and port are both unused are inserted;
    /// existing rows always win. Returns the number inserted.
    pub async fn load_baseline(&self, channels: &[BaselineChannel]) -> Result<u64, DatabaseError> {
        let mut inserted = 0;
        for ch in channels {
            let config =
                serde_json::to_value(ch).map_err(|e| DatabaseError::Query(e.to_string()))?;
            if self.register(&ch.name, ch.port, &ch.schema, &config).await? {
                inserted += 1;
            } else {
                debug!(
                    channel = %ch.name,
                    port = ch.port,
                    "Baseline channel already present, keeping registry row"
                );
            }
        }
        Ok(inserted)
    }
}
