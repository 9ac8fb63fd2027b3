//! Core domain types
//!
//! Fundamental entities shared between the coordinator (which persists and
//! schedules them) and the agents (which execute them).

pub mod agent;
pub mod pipeline;
pub mod run;

pub use agent::{Agent, AgentStatus};
pub use pipeline::{Pipeline, Stage, TaskKind};
pub use run::{JobRun, WorkUnit};
