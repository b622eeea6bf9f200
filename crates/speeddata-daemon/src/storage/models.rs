//! Registry models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::db::DatabaseError;

/// Raw `channels` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelRow {
    pub name: String,
    pub port: i64,
    pub schema_path: String,
    pub config_json: Option<String>,
    pub status: String,
    pub pid: Option<i64>,
    pub last_heartbeat: Option<i64>,
    pub created_at: i64,
}

/// A registered channel as handed to the rest of the daemon.
///
/// `config` is the parsed form of the stored `config_json`; the raw text
/// never leaves the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub port: u16,
    pub schema_path: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    pub status: ChannelStatus,
    pub pid: Option<u32>,
    pub last_heartbeat: Option<i64>,
    pub created_at: i64,
}

impl TryFrom<ChannelRow> for Channel {
    type Error = DatabaseError;

    fn try_from(row: ChannelRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port)
            .map_err(|_| DatabaseError::Query(format!("channel {} has port {}", row.name, row.port)))?;
        let config = match row.config_json.as_deref() {
            Some(text) => serde_json::from_str(text).map_err(|e| {
                DatabaseError::Query(format!("channel {} has unreadable config: {e}", row.name))
            })?,
            None => Value::Null,
        };
        let status = ChannelStatus::parse(&row.status).ok_or_else(|| {
            DatabaseError::Query(format!("channel {} has status '{}'", row.name, row.status))
        })?;

        Ok(Self {
            name: row.name,
            port,
            schema_path: row.schema_path,
            config,
            status,
            pid: row.pid.and_then(|p| u32::try_from(p).ok()),
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
        })
    }
}

/// Channel lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// Known to the registry, no worker attached.
    Registered,
    /// A worker is running; `pid` is set.
    Active,
}

impl ChannelStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(Self::Registered),
            "active" => Some(Self::Active),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
