//! Relay worker errors.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Relay worker errors. Every variant is fatal to the worker.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Socket setup failed: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Log write to {path} failed: {source}")]
    LogWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid relay configuration: {0}")]
    Config(String),
}
