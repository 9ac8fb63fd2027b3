//! Backhaul Core
//!
//! Shared types and contracts for the Backhaul backup orchestration system.
//!
//! This crate contains:
//! - Domain types: Pipeline, Stage, JobRun, WorkUnit, Agent
//! - RPC protocol: envelopes, framing, transaction correlation
//! - Adapter contract: the TaskAdapter trait, registry, and reference adapters

pub mod adapter;
pub mod domain;
pub mod rpc;
