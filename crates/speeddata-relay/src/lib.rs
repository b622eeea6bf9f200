//! `SpeedData` Relay Worker Library
//!
//! One worker serves one channel:
//! - UDP ingest on the channel's port
//! - Full-rate and decimated fan-out to two multicast groups
//! - Append-only rotating record log

pub mod decimator;
pub mod error;
pub mod log_writer;
pub mod pipeline;
pub mod settings;

pub use decimator::Decimator;
pub use error::RelayError;
pub use log_writer::RotatingLog;
pub use pipeline::{Relay, RelayStats};
pub use settings::RelayArgs;
