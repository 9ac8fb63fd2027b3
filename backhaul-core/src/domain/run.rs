//! Run domain types
//!
//! A `JobRun` is one execution of a pipeline; a `WorkUnit` is one
//! (stage, item) execution record belonging to exactly one run and stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the run was stopped by request rather than finishing.
    pub stopped: bool,
    /// Logical OR of all work unit error flags.
    pub is_error: bool,
    pub result_message: Option<String>,
    pub run_time_ms: Option<i64>,
}

impl JobRun {
    pub fn new(pipeline_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            started_at: Utc::now(),
            completed_at: None,
            stopped: false,
            is_error: false,
            result_message: None,
            run_time_ms: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One (stage, item) execution record.
///
/// All work units sharing an `item_name` within a run form a chain ordered
/// by `stage_order`; the unit at order N starts only after the same-item
/// unit at N-1 is completed, whatever that predecessor's error flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: Uuid,
    pub run_id: Uuid,
    pub stage_id: Uuid,
    /// The subject this unit acts on, e.g. a database name.
    pub item_name: String,
    /// Mirrors the owning stage's order.
    pub stage_order: u32,
    /// Deterministic tie-break among items of the same stage.
    pub item_order: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_error: bool,
    pub result_message: Option<String>,
    /// Opaque handle handed to the next chained stage for the same item.
    pub result_artifact: Option<String>,
}

impl WorkUnit {
    pub fn is_pending(&self) -> bool {
        self.started_at.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.completed_at.is_none()
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Work unit descriptor produced by `TaskAdapter::setup`.
///
/// Setup only describes work; identities, ordering, and run bookkeeping are
/// stamped by the engine when the batch is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnitSeed {
    pub item_name: String,
}

impl WorkUnitSeed {
    pub fn new(item_name: impl Into<String>) -> Self {
        Self {
            item_name: item_name.into(),
        }
    }

    /// Materializes the seed into a pending work unit row.
    pub fn into_work_unit(self, run_id: Uuid, stage_id: Uuid, stage_order: u32, item_order: u32) -> WorkUnit {
        WorkUnit {
            id: Uuid::new_v4(),
            run_id,
            stage_id,
            item_name: self.item_name,
            stage_order,
            item_order,
            started_at: None,
            completed_at: None,
            is_error: false,
            result_message: None,
            result_artifact: None,
        }
    }
}
