//! `SpeedData` Daemon Library
//!
//! Core functionality for the `SpeedData` relay fleet daemon:
//! - `SQLite` channel registry
//! - Relay worker supervision (spawn, stop, health checks, restarts)
//! - HTTP control plane for runtime channel registration

pub mod api;
pub mod storage;
pub mod supervisor;
