//! Reference delete adapter
//!
//! Chained stage that removes the upstream artifact for the same item. The
//! chain rule dispatches it even when the upstream unit failed, which is
//! exactly what a cleanup stage wants: an upstream failure simply means
//! there is nothing to delete.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::run::WorkUnitSeed;
use crate::domain::{Pipeline, Stage, TaskKind, WorkUnit};

use super::{ProgressSink, TaskAdapter, TaskError, TaskOutput, chained_seeds};

pub struct CleanupAdapter;

impl CleanupAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CleanupAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskAdapter for CleanupAdapter {
    fn kind(&self) -> TaskKind {
        TaskKind::Delete
    }

    fn setup(
        &self,
        _pipeline: &Pipeline,
        stage: &Stage,
        previous: &[WorkUnit],
        _run_id: Uuid,
    ) -> Result<Vec<WorkUnitSeed>, TaskError> {
        chained_seeds(stage, previous)
    }

    async fn run(
        &self,
        _stage: &Stage,
        unit: &WorkUnit,
        previous: Option<&WorkUnit>,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let Some(artifact) = previous.and_then(|p| p.result_artifact.as_deref()) else {
            return Ok(TaskOutput::new(
                format!("nothing to delete for '{}'", unit.item_name),
                None,
            ));
        };

        progress.send(format!("{}: deleting {}", unit.item_name, artifact));

        match tokio::fs::remove_file(artifact).await {
            Ok(()) => Ok(TaskOutput::new(format!("deleted {}", artifact), None)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TaskOutput::new(
                format!("{} was already gone", artifact),
                None,
            )),
            Err(e) => Err(TaskError::Failed(format!(
                "cannot delete '{}': {}",
                artifact, e
            ))),
        }
    }
}
