//! Backhaul Agent
//!
//! The worker process that holds one persistent connection to the
//! coordinator, executes dispatched work units through task adapters, and
//! ships telemetry back in batches.

pub mod config;
pub mod connection;
pub mod executor;
pub mod telemetry;
