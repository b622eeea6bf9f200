//! Per-channel relay settings.
//!
//! A channel's registry row carries an opaque `config` mapping. The daemon
//! reads it as [`ChannelOverrides`], layers it over the fleet defaults and
//! hands the resolved [`WorkerSettings`] to the relay worker through its
//! environment (see [`env`]).

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable names read by the relay worker.
pub mod env {
    pub const RX_PORT: &str = "RELAY_RX_PORT";
    pub const BIND_ADDR: &str = "RELAY_BIND_ADDR";
    pub const OUTPUT_DIR: &str = "RELAY_OUTPUT_DIR";
    pub const DECIMATION_ENABLED: &str = "RELAY_DECIMATION_ENABLED";
    pub const DECIMATION_FACTOR: &str = "RELAY_DECIMATION_FACTOR";
    pub const DECIMATION_ALGORITHM: &str = "RELAY_DECIMATION_ALGORITHM";
    pub const ROTATION_MODE: &str = "RELAY_ROTATION_MODE";
    pub const ROTATION_THRESHOLD: &str = "RELAY_ROTATION_THRESHOLD";
    pub const MCAST_FULL_ADDR: &str = "RELAY_MCAST_FULL_ADDR";
    pub const MCAST_FULL_PORT: &str = "RELAY_MCAST_FULL_PORT";
    pub const MCAST_DEC_ADDR: &str = "RELAY_MCAST_DEC_ADDR";
    pub const MCAST_DEC_PORT: &str = "RELAY_MCAST_DEC_PORT";
    pub const MCAST_TTL: &str = "RELAY_MCAST_TTL";
}

/// Decimation algorithm tag.
///
/// Payloads are opaque, so every variant currently selects the most recent
/// payload of the window. The tag is still carried end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecimationAlgorithm {
    #[default]
    Downsample,
    Average,
    #[serde(alias = "min-max", alias = "min_max")]
    MinMax,
    Rms,
}

impl DecimationAlgorithm {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Downsample => "downsample",
            Self::Average => "average",
            Self::MinMax => "minmax",
            Self::Rms => "rms",
        }
    }
}

impl fmt::Display for DecimationAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecimationAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "downsample" => Ok(Self::Downsample),
            "average" => Ok(Self::Average),
            "minmax" | "min-max" | "min_max" => Ok(Self::MinMax),
            "rms" => Ok(Self::Rms),
            other => Err(Error::ChannelSettings(format!(
                "unknown decimation algorithm '{other}'"
            ))),
        }
    }
}

/// Log rotation trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    /// Rotate once the current file reaches the byte threshold.
    #[default]
    Size,
    /// Never rotate; one file per worker lifetime.
    None,
}

impl RotationMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::None => "none",
        }
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "size" => Ok(Self::Size),
            "none" | "off" => Ok(Self::None),
            other => Err(Error::ChannelSettings(format!(
                "unknown rotation mode '{other}'"
            ))),
        }
    }
}

/// Decimation section (fleet default or resolved per channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecimationSettings {
    pub enabled: bool,
    pub factor: u32,
    pub algorithm: DecimationAlgorithm,
}

impl Default for DecimationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            factor: 50,
            algorithm: DecimationAlgorithm::Downsample,
        }
    }
}

/// Rotation section (fleet default or resolved per channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub mode: RotationMode,
    /// Bytes written to one file before the next write rotates.
    pub threshold: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            mode: RotationMode::Size,
            threshold: 50 * 1024 * 1024, // 50 MiB
        }
    }
}

impl RotationSettings {
    /// Size rotation needs a positive threshold.
    pub fn validate(&self) -> Result<()> {
        if self.mode == RotationMode::Size && self.threshold == 0 {
            return Err(Error::ChannelSettings(
                "rotation threshold must be positive in size mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// One multicast destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastTarget {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for MulticastTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Multicast section: full-rate and decimated destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastSettings {
    pub full_rate: MulticastTarget,
    pub decimated: MulticastTarget,
    pub ttl: u32,
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            full_rate: MulticastTarget {
                address: Ipv4Addr::new(239, 1, 1, 1),
                port: 6000,
            },
            decimated: MulticastTarget {
                address: Ipv4Addr::new(239, 1, 1, 2),
                port: 6001,
            },
            ttl: 2,
        }
    }
}

impl MulticastSettings {
    /// Destinations need a non-zero port and the TTL must fit in one byte.
    pub fn validate(&self) -> Result<()> {
        for (stream, target) in [("full_rate", self.full_rate), ("decimated", self.decimated)] {
            if target.port == 0 {
                return Err(Error::ChannelSettings(format!(
                    "multicast {stream} port must be non-zero"
                )));
            }
        }
        if self.ttl > 255 {
            return Err(Error::ChannelSettings(format!(
                "multicast ttl {} exceeds 255",
                self.ttl
            )));
        }
        Ok(())
    }
}

/// Per-channel overrides read from the registry's opaque `config` mapping.
///
/// Unknown keys are ignored so baseline entries can be stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimation: Option<DecimationOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multicast: Option<MulticastOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecimationOverrides {
    pub enabled: Option<bool>,
    pub factor: Option<u32>,
    pub algorithm: Option<DecimationAlgorithm>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationOverrides {
    pub mode: Option<RotationMode>,
    pub threshold: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastOverrides {
    pub full_rate: Option<MulticastTarget>,
    pub decimated: Option<MulticastTarget>,
    pub ttl: Option<u32>,
}

impl ChannelOverrides {
    /// Read overrides from a stored `config` value. `null` means none.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        if !value.is_object() {
            return Err(Error::ChannelSettings(
                "channel config must be a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value.clone()).map_err(|e| Error::ChannelSettings(e.to_string()))
    }
}

/// Fleet-wide defaults that channel overrides are layered over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDefaults {
    pub bind_addr: Ipv4Addr,
    pub output_dir: PathBuf,
    pub decimation: DecimationSettings,
    pub rotation: RotationSettings,
    pub multicast: MulticastSettings,
}

/// Fully resolved settings for one relay worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub name: String,
    pub rx_port: u16,
    pub bind_addr: Ipv4Addr,
    pub output_dir: PathBuf,
    pub decimation: DecimationSettings,
    pub rotation: RotationSettings,
    pub multicast: MulticastSettings,
}

impl WorkerSettings {
    /// Layer `overrides` over `defaults` for channel `name` on `rx_port`.
    pub fn resolve(
        name: &str,
        rx_port: u16,
        defaults: &RelayDefaults,
        overrides: &ChannelOverrides,
    ) -> Self {
        let mut decimation = defaults.decimation.clone();
        if let Some(d) = &overrides.decimation {
            decimation.enabled = d.enabled.unwrap_or(decimation.enabled);
            decimation.factor = d.factor.unwrap_or(decimation.factor);
            decimation.algorithm = d.algorithm.unwrap_or(decimation.algorithm);
        }

        let mut rotation = defaults.rotation.clone();
        if let Some(r) = &overrides.rotation {
            rotation.mode = r.mode.unwrap_or(rotation.mode);
            rotation.threshold = r.threshold.unwrap_or(rotation.threshold);
        }

        let mut multicast = defaults.multicast.clone();
        if let Some(m) = &overrides.multicast {
            multicast.full_rate = m.full_rate.unwrap_or(multicast.full_rate);
            multicast.decimated = m.decimated.unwrap_or(multicast.decimated);
            multicast.ttl = m.ttl.unwrap_or(multicast.ttl);
        }

        Self {
            name: name.to_string(),
            rx_port,
            bind_addr: defaults.bind_addr,
            output_dir: defaults.output_dir.clone(),
            decimation,
            rotation,
            multicast,
        }
    }

    /// Checks the relay worker applies before binding anything. The daemon
    /// runs the same checks at registration so a bad `config` never reaches
    /// a worker.
    pub fn validate(&self) -> Result<()> {
        if self.rx_port == 0 {
            return Err(Error::ChannelSettings("ingest port must be non-zero".to_string()));
        }
        self.rotation.validate()?;
        self.multicast.validate()
    }

    /// Environment passed to the worker process.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (env::RX_PORT, self.rx_port.to_string()),
            (env::BIND_ADDR, self.bind_addr.to_string()),
            (env::OUTPUT_DIR, self.output_dir.display().to_string()),
            (env::DECIMATION_ENABLED, self.decimation.enabled.to_string()),
            (env::DECIMATION_FACTOR, self.decimation.factor.to_string()),
            (env::DECIMATION_ALGORITHM, self.decimation.algorithm.to_string()),
            (env::ROTATION_MODE, self.rotation.mode.to_string()),
            (env::ROTATION_THRESHOLD, self.rotation.threshold.to_string()),
            (env::MCAST_FULL_ADDR, self.multicast.full_rate.address.to_string()),
            (env::MCAST_FULL_PORT, self.multicast.full_rate.port.to_string()),
            (env::MCAST_DEC_ADDR, self.multicast.decimated.address.to_string()),
            (env::MCAST_DEC_PORT, self.multicast.decimated.port.to_string()),
            (env::MCAST_TTL, self.multicast.ttl.to_string()),
        ]
    }
}
