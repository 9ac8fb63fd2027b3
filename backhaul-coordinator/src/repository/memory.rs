//! In-memory repository
//!
//! Flat maps keyed by id; work unit chains are resolved by
//! (run, item, stage order) lookups on the ordered read path, never by
//! embedded references.

use async_trait::async_trait;
use backhaul_core::domain::{Agent, JobRun, Pipeline, WorkUnit};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{RepoResult, Repository, RepositoryError};

#[derive(Default)]
struct Store {
    pipelines: HashMap<Uuid, Pipeline>,
    runs: HashMap<Uuid, JobRun>,
    work_units: HashMap<Uuid, WorkUnit>,
    agents: HashMap<String, Agent>,
}

/// The bundled, process-local repository implementation.
#[derive(Default)]
pub struct MemoryRepository {
    store: Mutex<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_pipeline(&self, pipeline: Pipeline) -> RepoResult<()> {
        let mut store = self.store.lock().await;
        store.pipelines.insert(pipeline.id, pipeline);
        Ok(())
    }

    async fn find_pipeline(&self, id: Uuid) -> RepoResult<Option<Pipeline>> {
        let store = self.store.lock().await;
        Ok(store.pipelines.get(&id).cloned())
    }

    async fn list_active_pipelines(&self) -> RepoResult<Vec<Pipeline>> {
        let store = self.store.lock().await;
        let mut pipelines: Vec<Pipeline> =
            store.pipelines.values().filter(|p| p.active).cloned().collect();
        pipelines.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        Ok(pipelines)
    }

    async fn create_run(&self, run: JobRun) -> RepoResult<()> {
        let mut store = self.store.lock().await;
        store.runs.insert(run.id, run);
        Ok(())
    }

    async fn find_run(&self, id: Uuid) -> RepoResult<Option<JobRun>> {
        let store = self.store.lock().await;
        Ok(store.runs.get(&id).cloned())
    }

    async fn update_run(&self, run: JobRun) -> RepoResult<()> {
        let mut store = self.store.lock().await;
        if !store.runs.contains_key(&run.id) {
            return Err(RepositoryError(format!("run {} does not exist", run.id)));
        }
        store.runs.insert(run.id, run);
        Ok(())
    }

    async fn incomplete_runs_for_pipeline(
        &self,
        pipeline_id: Uuid,
        exclude: Uuid,
    ) -> RepoResult<Vec<JobRun>> {
        let store = self.store.lock().await;
        Ok(store
            .runs
            .values()
            .filter(|r| r.pipeline_id == pipeline_id && r.id != exclude && !r.is_completed())
            .cloned()
            .collect())
    }

    async fn insert_work_units(&self, units: Vec<WorkUnit>) -> RepoResult<()> {
        let mut store = self.store.lock().await;
        for unit in units {
            store.work_units.insert(unit.id, unit);
        }
        Ok(())
    }

    async fn find_work_unit(&self, id: Uuid) -> RepoResult<Option<WorkUnit>> {
        let store = self.store.lock().await;
        Ok(store.work_units.get(&id).cloned())
    }

    async fn update_work_unit(&self, unit: WorkUnit) -> RepoResult<()> {
        let mut store = self.store.lock().await;
        if !store.work_units.contains_key(&unit.id) {
            return Err(RepositoryError(format!("work unit {} does not exist", unit.id)));
        }
        store.work_units.insert(unit.id, unit);
        Ok(())
    }

    async fn work_units_for_run(&self, run_id: Uuid) -> RepoResult<Vec<WorkUnit>> {
        let store = self.store.lock().await;
        let mut units: Vec<WorkUnit> = store
            .work_units
            .values()
            .filter(|u| u.run_id == run_id)
            .cloned()
            .collect();
        units.sort_by_key(|u| (u.stage_order, u.item_order));
        Ok(units)
    }

    async fn upsert_agent(&self, agent: Agent) -> RepoResult<()> {
        let mut store = self.store.lock().await;
        store.agents.insert(agent.key.clone(), agent);
        Ok(())
    }

    async fn find_agent(&self, key: &str) -> RepoResult<Option<Agent>> {
        let store = self.store.lock().await;
        Ok(store.agents.get(key).cloned())
    }

    async fn list_agents(&self) -> RepoResult<Vec<Agent>> {
        let store = self.store.lock().await;
        let mut agents: Vec<Agent> = store.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(agents)
    }
}
