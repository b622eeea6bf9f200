//! `SpeedData` Core Library
//!
//! Shared functionality for `SpeedData` components:
//! - Fleet configuration loading (TOML file + environment overrides)
//! - Per-channel relay settings and the worker environment contract
//! - `SQLite` pool helpers for the channel registry
//! - Common error types and tracing setup

pub mod channel;
pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use channel::{
    ChannelOverrides, DecimationAlgorithm, RelayDefaults, RotationMode, WorkerSettings,
};
pub use config::FleetConfig;
pub use error::{Error, Result};
