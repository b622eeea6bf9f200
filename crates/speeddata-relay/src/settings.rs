//! Worker command line and environment.
//!
//! The supervisor passes everything through `RELAY_*` environment
//! variables; each one can also be given as a flag.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use speeddata_core::channel::{
    DecimationSettings, MulticastSettings, MulticastTarget, RotationSettings, env as vars,
};
use speeddata_core::{DecimationAlgorithm, RotationMode, WorkerSettings};
use tracing::warn;

use crate::error::RelayError;

#[derive(Parser, Debug, Clone)]
#[command(name = "speeddata-relay")]
#[command(version, about = "SpeedData relay worker - one channel's ingest, fan-out and log")]
pub struct RelayArgs {
    /// Channel name
    pub channel: String,

    /// UDP ingest port
    #[arg(long, env = vars::RX_PORT)]
    pub rx_port: u16,

    /// Address the ingest socket binds to
    #[arg(long, env = vars::BIND_ADDR, default_value = "127.0.0.1")]
    pub bind_addr: Ipv4Addr,

    /// Directory for record log files
    #[arg(long, env = vars::OUTPUT_DIR, default_value = "./data")]
    pub output_dir: PathBuf,

    /// Send a decimated stream to the second multicast group
    #[arg(
        long,
        env = vars::DECIMATION_ENABLED,
        default_value = "false",
        value_parser = parse_flag,
        action = ArgAction::Set
    )]
    pub decimation_enabled: bool,

    /// Payloads per decimation window
    #[arg(long, env = vars::DECIMATION_FACTOR, default_value_t = 50)]
    pub decimation_factor: u32,

    /// Decimation algorithm tag (unknown values fall back to downsample)
    #[arg(long, env = vars::DECIMATION_ALGORITHM, default_value = "downsample")]
    pub decimation_algorithm: String,

    /// Log rotation mode: size or none
    #[arg(long, env = vars::ROTATION_MODE, default_value = "size")]
    pub rotation_mode: String,

    /// Bytes per log file before rotating
    #[arg(long, env = vars::ROTATION_THRESHOLD, default_value_t = 50 * 1024 * 1024)]
    pub rotation_threshold: u64,

    #[arg(long, env = vars::MCAST_FULL_ADDR, default_value = "239.1.1.1")]
    pub mcast_full_addr: Ipv4Addr,

    #[arg(long, env = vars::MCAST_FULL_PORT, default_value_t = 6000)]
    pub mcast_full_port: u16,

    #[arg(long, env = vars::MCAST_DEC_ADDR, default_value = "239.1.1.2")]
    pub mcast_dec_addr: Ipv4Addr,

    #[arg(long, env = vars::MCAST_DEC_PORT, default_value_t = 6001)]
    pub mcast_dec_port: u16,

    /// Multicast TTL for both groups
    #[arg(long, env = vars::MCAST_TTL, default_value_t = 2)]
    pub mcast_ttl: u32,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "RELAY_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "RELAY_LOG_JSON")]
    pub log_json: bool,
}

impl RelayArgs {
    /// Resolve into worker settings. Call after tracing is initialised so the
    /// algorithm fallback warning is visible.
    pub fn into_settings(self) -> Result<WorkerSettings, RelayError> {
        let algorithm = self
            .decimation_algorithm
            .parse::<DecimationAlgorithm>()
            .unwrap_or_else(|_| {
                warn!(
                    algorithm = %self.decimation_algorithm,
                    "Unknown decimation algorithm, using downsample"
                );
                DecimationAlgorithm::Downsample
            });
        let mode = self
            .rotation_mode
            .parse::<RotationMode>()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let settings = WorkerSettings {
            name: self.channel,
            rx_port: self.rx_port,
            bind_addr: self.bind_addr,
            output_dir: self.output_dir,
            decimation: DecimationSettings {
                enabled: self.decimation_enabled,
                factor: self.decimation_factor,
                algorithm,
            },
            rotation: RotationSettings {
                mode,
                threshold: self.rotation_threshold,
            },
            multicast: MulticastSettings {
                full_rate: MulticastTarget {
                    address: self.mcast_full_addr,
                    port: self.mcast_full_port,
                },
                decimated: MulticastTarget {
                    address: self.mcast_dec_addr,
                    port: self.mcast_dec_port,
                },
                ttl: self.mcast_ttl,
            },
        };
        settings
            .validate()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        Ok(settings)
    }
}

/// `true`/`1`/`yes`/`on` enable, `false`/`0`/`no`/`off`/empty disable.
fn parse_flag(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(format!("expected true/false, got '{other}'")),
    }
}
