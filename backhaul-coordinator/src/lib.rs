//! Backhaul Coordinator
//!
//! The central process of the Backhaul system. It owns the pipeline
//! definitions, expands triggered runs into per-item work units, dispatches
//! eligible units to the agents that own their stages, and advances each
//! run as completions stream back.
//!
//! Layers:
//! - Repository: storage boundary for pipelines, runs, work units, agents
//! - Engine: the job run state machine (setup, execute, complete, stop)
//! - Hub + server: coordinator side of the duplex agent RPC transport
//! - API: minimal HTTP surface for manual triggers and status

pub mod api;
pub mod config;
pub mod engine;
pub mod hub;
pub mod repository;
pub mod server;
