//! Repository module
//!
//! Storage boundary for the coordinator. Durable persistence lives outside
//! the core; the engine only ever sees this trait. `MemoryRepository` is
//! the bundled implementation.

pub mod memory;

pub use memory::MemoryRepository;

use async_trait::async_trait;
use backhaul_core::domain::{Agent, JobRun, Pipeline, WorkUnit};
use uuid::Uuid;

/// Storage failure, opaque to the engine.
#[derive(Debug, Clone)]
pub struct RepositoryError(pub String);

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "repository error: {}", self.0)
    }
}

impl std::error::Error for RepositoryError {}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Data access for pipelines, runs, work units, and agents.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_pipeline(&self, pipeline: Pipeline) -> RepoResult<()>;
    async fn find_pipeline(&self, id: Uuid) -> RepoResult<Option<Pipeline>>;
    async fn list_active_pipelines(&self) -> RepoResult<Vec<Pipeline>>;

    async fn create_run(&self, run: JobRun) -> RepoResult<()>;
    async fn find_run(&self, id: Uuid) -> RepoResult<Option<JobRun>>;
    async fn update_run(&self, run: JobRun) -> RepoResult<()>;
    /// Non-completed runs of a pipeline, excluding `exclude` itself.
    async fn incomplete_runs_for_pipeline(
        &self,
        pipeline_id: Uuid,
        exclude: Uuid,
    ) -> RepoResult<Vec<JobRun>>;

    /// Inserts the whole expansion of one run in a single batch.
    async fn insert_work_units(&self, units: Vec<WorkUnit>) -> RepoResult<()>;
    async fn find_work_unit(&self, id: Uuid) -> RepoResult<Option<WorkUnit>>;
    async fn update_work_unit(&self, unit: WorkUnit) -> RepoResult<()>;
    /// All units of a run, ordered by `(stage_order, item_order)`, the
    /// deterministic tie-break used throughout the engine.
    async fn work_units_for_run(&self, run_id: Uuid) -> RepoResult<Vec<WorkUnit>>;

    async fn upsert_agent(&self, agent: Agent) -> RepoResult<()>;
    async fn find_agent(&self, key: &str) -> RepoResult<Option<Agent>>;
    async fn list_agents(&self) -> RepoResult<Vec<Agent>>;
}
