//! `SQLite` channel registry for the `SpeedData` daemon.
//!
//! The registry is the fleet's durable source of truth: channel
//! definitions plus the pid/status of the worker currently serving each one.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
