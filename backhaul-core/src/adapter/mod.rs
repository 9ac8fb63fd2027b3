//! Task adapter contract
//!
//! A `TaskAdapter` performs the actual work of one pipeline stage for one
//! item. The core never knows what a stage really does; it only calls this
//! contract. Setup runs on the coordinator during run expansion, `run` on
//! the agent that owns the stage.
//!
//! Progress flows through an explicit channel-backed sink instead of
//! multicast callbacks, and the terminal completion is the *return value*
//! of `run`: the executor turns it into exactly one `CompleteEvent`, so an
//! adapter cannot double-complete a work unit.

mod cleanup;
mod compress;
mod dump;

pub use cleanup::CleanupAdapter;
pub use compress::CompressAdapter;
pub use dump::DumpAdapter;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::run::WorkUnitSeed;
use crate::domain::{Pipeline, Stage, TaskKind, WorkUnit};

/// Failure taxonomy for adapter work. All variants surface as error
/// completions; none of them crash the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Bad stage settings, e.g. a missing output path.
    Validation(String),
    /// The work itself failed.
    Failed(String),
    /// The cancellation token fired before the work finished.
    Cancelled,
    /// The stage deadline expired.
    TimedOut,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Validation(msg) => write!(f, "invalid stage settings: {}", msg),
            TaskError::Failed(msg) => write!(f, "{}", msg),
            TaskError::Cancelled => write!(f, "task was cancelled"),
            TaskError::TimedOut => write!(f, "task timed out"),
        }
    }
}

impl std::error::Error for TaskError {}

/// Successful outcome of one work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub message: String,
    /// Opaque handle for the next chained stage; only ever set for work
    /// that fully completed.
    pub artifact: Option<String>,
}

impl TaskOutput {
    pub fn new(message: impl Into<String>, artifact: Option<String>) -> Self {
        Self {
            message: message.into(),
            artifact,
        }
    }
}

/// Channel-backed sink for non-terminal progress messages.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ProgressSink {
    /// Creates a sink and the receiving half the dispatcher drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose messages go nowhere, for setup-only call sites and tests.
    pub fn discard() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    /// Reports progress. A dropped receiver means the dispatcher has moved
    /// on; the message is silently discarded.
    pub fn send(&self, message: impl Into<String>) {
        let _ = self.tx.send(message.into());
    }
}

/// The work of one pipeline stage for one item.
#[async_trait]
pub trait TaskAdapter: Send + Sync {
    /// The stage kind this adapter implements.
    fn kind(&self) -> TaskKind;

    /// Expands a stage into per-item work unit descriptors.
    ///
    /// Deterministic and side-effect free. For a chained stage, `previous`
    /// holds the upstream stage's units and the descriptors inherit their
    /// item names, one per item.
    fn setup(
        &self,
        pipeline: &Pipeline,
        stage: &Stage,
        previous: &[WorkUnit],
        run_id: Uuid,
    ) -> Result<Vec<WorkUnitSeed>, TaskError>;

    /// Executes one work unit.
    ///
    /// Must observe `cancel` at bounded intervals and exit promptly when it
    /// fires, releasing any partial artifacts. Must never return an
    /// artifact for work that did not fully complete.
    async fn run(
        &self,
        stage: &Stage,
        unit: &WorkUnit,
        previous: Option<&WorkUnit>,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError>;

    /// Probes connectivity of kind-specific settings.
    async fn test_connection(
        &self,
        _settings: &HashMap<String, Value>,
    ) -> Result<String, TaskError> {
        Err(TaskError::Failed(format!(
            "{} does not support connection tests",
            self.kind()
        )))
    }

    /// Lists the databases reachable with kind-specific settings.
    async fn list_databases(
        &self,
        _settings: &HashMap<String, Value>,
    ) -> Result<Vec<String>, TaskError> {
        Err(TaskError::Failed(format!(
            "{} does not list databases",
            self.kind()
        )))
    }
}

/// Seeds for a chained stage: one per upstream item, inheriting its name.
pub fn chained_seeds(stage: &Stage, previous: &[WorkUnit]) -> Result<Vec<WorkUnitSeed>, TaskError> {
    if stage.upstream_stage_id.is_none() {
        return Err(TaskError::Validation(format!(
            "{} stage requires an upstream stage to chain on",
            stage.kind
        )));
    }
    Ok(previous
        .iter()
        .map(|unit| WorkUnitSeed::new(unit.item_name.clone()))
        .collect())
}

/// Closed registry of task adapters keyed by kind.
pub struct AdapterRegistry {
    adapters: HashMap<TaskKind, Arc<dyn TaskAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with the built-in filesystem reference adapters.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DumpAdapter::new()));
        registry.register(Arc::new(CompressAdapter::new()));
        registry.register(Arc::new(CleanupAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn TaskAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Fails when any stage names a kind with no registered adapter, so a
    /// bad definition dies at configuration load instead of at dispatch.
    pub fn validate_pipeline(&self, pipeline: &Pipeline) -> Result<(), String> {
        for stage in &pipeline.stages {
            if !self.adapters.contains_key(&stage.kind) {
                return Err(format!(
                    "pipeline '{}' stage {} uses kind {} with no registered adapter",
                    pipeline.name, stage.stage_order, stage.kind
                ));
            }
        }
        Ok(())
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_of_kind(kind: TaskKind, upstream: Option<Uuid>) -> Stage {
        Stage {
            id: Uuid::new_v4(),
            pipeline_id: Uuid::nil(),
            kind,
            stage_order: 1,
            parallel: 1,
            upstream_stage_id: upstream,
            timeout_seconds: None,
            settings: HashMap::new(),
            agent_key: "vault-1".to_string(),
        }
    }

    #[test]
    fn test_standard_registry_covers_reference_kinds() {
        let registry = AdapterRegistry::standard();
        assert!(registry.get(TaskKind::CreateBackup).is_some());
        assert!(registry.get(TaskKind::Compress).is_some());
        assert!(registry.get(TaskKind::Delete).is_some());
        assert!(registry.get(TaskKind::Upload).is_none());
        assert!(registry.get(TaskKind::Restore).is_none());
    }

    #[test]
    fn test_validate_pipeline_rejects_unregistered_kind() {
        let registry = AdapterRegistry::standard();
        let mut stage = stage_of_kind(TaskKind::Upload, None);
        stage.stage_order = 0;
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            name: "nightly".to_string(),
            schedule: None,
            priority: 0,
            active: true,
            stages: vec![stage],
        };
        let err = registry.validate_pipeline(&pipeline).unwrap_err();
        assert!(err.contains("Upload"));
    }

    #[test]
    fn test_chained_seeds_inherit_item_names() {
        let upstream_id = Uuid::new_v4();
        let stage = stage_of_kind(TaskKind::Compress, Some(upstream_id));
        let previous: Vec<WorkUnit> = ["sales", "orders"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                WorkUnitSeed::new(*name).into_work_unit(Uuid::new_v4(), upstream_id, 0, i as u32)
            })
            .collect();

        let seeds = chained_seeds(&stage, &previous).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].item_name, "sales");
        assert_eq!(seeds[1].item_name, "orders");
    }

    #[test]
    fn test_chained_seeds_require_upstream_reference() {
        let stage = stage_of_kind(TaskKind::Compress, None);
        assert!(matches!(
            chained_seeds(&stage, &[]),
            Err(TaskError::Validation(_))
        ));
    }

    #[test]
    fn test_progress_sink_delivers_in_order() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.send("one");
        sink.send("two");
        assert_eq!(rx.try_recv().unwrap(), "one");
        assert_eq!(rx.try_recv().unwrap(), "two");
    }
}
