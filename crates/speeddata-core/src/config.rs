//! Fleet configuration for `SpeedData`.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Fleet config file (`config/speeddata.toml` unless told otherwise)
//! 3. Environment variables (`SPEEDDATA_*`)
//! 4. CLI arguments (applied by the daemon binary)

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::channel::{
    ChannelOverrides, DecimationSettings, MulticastSettings, RelayDefaults, RotationSettings,
};
use crate::error::{Error, Result};

/// Default location of the fleet config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/speeddata.toml";

/// Complete fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub multicast: MulticastSettings,
    #[serde(default)]
    pub decimation: DecimationSettings,
    #[serde(default)]
    pub rotation: RotationSettings,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Static baseline merged into the registry at startup.
    #[serde(default)]
    pub channels: Vec<BaselineChannel>,
}

/// Where workers write logs and where the registry lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    pub database_path: PathBuf,
    /// Address workers bind their ingest socket to.
    pub bind_addr: Ipv4Addr,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data"),
            database_path: PathBuf::from("./data/registry.db"),
            bind_addr: Ipv4Addr::LOCALHOST,
        }
    }
}

/// Process supervision policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub worker_bin: PathBuf,
    pub max_restarts: u32,
    pub restart_backoff_secs: u64,
    pub check_interval_secs: u64,
    pub stagger_ms: u64,
    pub settle_ms: u64,
    pub terminate_timeout_secs: u64,
    pub output_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_bin: PathBuf::from("speeddata-relay"),
            max_restarts: 5,
            restart_backoff_secs: 5,
            check_interval_secs: 2,
            stagger_ms: 500,
            settle_ms: 1000,
            terminate_timeout_secs: 5,
            output_tail_lines: 50,
        }
    }
}

/// Control plane listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// One statically configured channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineChannel {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub schema: String,
    #[serde(flatten)]
    pub overrides: ChannelOverrides,
}

impl FleetConfig {
    /// Defaults every worker starts from before channel overrides apply.
    pub fn relay_defaults(&self) -> RelayDefaults {
        RelayDefaults {
            bind_addr: self.storage.bind_addr,
            output_dir: self.storage.output_dir.clone(),
            decimation: self.decimation.clone(),
            rotation: self.rotation.clone(),
            multicast: self.multicast.clone(),
        }
    }
}

/// Load the fleet configuration.
///
/// `path` is the config file to read; `None` means [`DEFAULT_CONFIG_PATH`].
/// A missing default file is not an error, a missing explicit one is.
pub fn load_config(path: Option<&Path>) -> Result<FleetConfig> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_config_file(default)?
            } else {
                FleetConfig::default()
            }
        }
    };

    apply_env_overrides(&mut config);
    validate(&mut config)?;

    Ok(config)
}

/// Parse a fleet config from TOML text.
pub fn parse_config(content: &str) -> Result<FleetConfig> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

fn load_config_file(path: &Path) -> Result<FleetConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut FleetConfig) {
    if let Ok(val) = std::env::var("SPEEDDATA_API_ADDR") {
        if let Ok(addr) = val.parse() {
            config.api.addr = addr;
        }
    }
    if let Ok(val) = std::env::var("SPEEDDATA_DB_PATH") {
        config.storage.database_path = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("SPEEDDATA_OUTPUT_DIR") {
        config.storage.output_dir = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("SPEEDDATA_WORKER_BIN") {
        config.supervisor.worker_bin = PathBuf::from(val);
    }
}

fn validate(config: &mut FleetConfig) -> Result<()> {
    if config.supervisor.check_interval_secs == 0 {
        return Err(Error::Config(
            "supervisor.check_interval_secs must be at least 1".to_string(),
        ));
    }
    config
        .rotation
        .validate()
        .and_then(|()| config.multicast.validate())
        .map_err(|e| Error::Config(format!("relay defaults: {e}")))?;

    dedup_baseline(&mut config.channels);
    Ok(())
}

/// Drop unnamed entries and later duplicates of a name or port; the first
/// entry wins.
fn dedup_baseline(channels: &mut Vec<BaselineChannel>) {
    let mut seen_names = HashSet::new();
    let mut seen_ports = HashSet::new();
    channels.retain(|ch| {
        if ch.name.is_empty() {
            warn!(port = ch.port, "Skipping baseline channel with empty name");
            return false;
        }
        if seen_names.contains(&ch.name) {
            warn!(channel = %ch.name, "Skipping duplicate baseline channel name");
            return false;
        }
        if !seen_ports.insert(ch.port) {
            warn!(channel = %ch.name, port = ch.port, "Skipping baseline channel on duplicate port");
            return false;
        }
        seen_names.insert(ch.name.clone());
        true
    });
}
