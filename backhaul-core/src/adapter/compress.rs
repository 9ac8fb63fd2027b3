//! Reference compress adapter
//!
//! Chained stage: consumes the upstream dump artifact for the same item and
//! produces a `.cmp` sibling. The "compression" is a framed copy; real
//! codecs are leaf connectors outside the core contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::run::WorkUnitSeed;
use crate::domain::{Pipeline, Stage, TaskKind, WorkUnit};

use super::{ProgressSink, TaskAdapter, TaskError, TaskOutput, chained_seeds};

pub struct CompressAdapter;

impl CompressAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CompressAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskAdapter for CompressAdapter {
    fn kind(&self) -> TaskKind {
        TaskKind::Compress
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
        let source = previous
            .and_then(|p| p.result_artifact.as_deref())
            .ok_or_else(|| {
                TaskError::Failed(format!(
                    "no upstream artifact to compress for item '{}'",
                    unit.item_name
                ))
            })?;

        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        progress.send(format!("{}: compressing {}", unit.item_name, source));

        let payload = tokio::fs::read(source)
            .await
            .map_err(|e| TaskError::Failed(format!("cannot read '{}': {}", source, e)))?;

        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let target = format!("{}.cmp", source);
        let mut framed = format!("backhaul-cmp v1 {}\n", payload.len()).into_bytes();
        framed.extend_from_slice(&payload);
        if let Err(e) = tokio::fs::write(&target, &framed).await {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(TaskError::Failed(format!(
                "cannot write '{}': {}",
                target, e
            )));
        }

        Ok(TaskOutput::new(
            format!(
                "compressed {} ({} bytes -> {} bytes)",
                unit.item_name,
                payload.len(),
                framed.len()
            ),
            Some(target),
        ))
    }
}
