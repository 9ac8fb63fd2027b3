//! Job run engine
//!
//! The state machine that turns a pipeline definition into per-item work
//! units and drives them to completion. Two separate mutexes guard run
//! expansion (setup) and the dispatch scan (execute), each with a bounded
//! acquisition wait: setup surfaces a lock timeout to its caller, while an
//! execute timeout is logged and swallowed because the next completion or
//! tick rescans anyway.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use backhaul_core::adapter::AdapterRegistry;
use backhaul_core::domain::{JobRun, Pipeline, WorkUnit};
use backhaul_core::rpc::{CompleteEvent, ProgressEvent, RpcError};

use crate::hub::Dispatcher;
use crate::repository::{Repository, RepositoryError};

const STOPPED_MESSAGE: &str = "stopped by request";

/// Engine failure taxonomy.
#[derive(Debug)]
pub enum EngineError {
    PipelineNotFound(Uuid),
    RunNotFound(Uuid),
    WorkUnitNotFound(Uuid),
    /// Another non-completed run of the same pipeline already exists.
    DuplicateRun(Uuid),
    /// The setup or execute mutex could not be acquired in time.
    LockTimeout(&'static str),
    /// Run expansion failed; the run has been marked errored and completed.
    Setup(String),
    Repository(String),
    Rpc(RpcError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::PipelineNotFound(id) => write!(f, "pipeline {} not found", id),
            EngineError::RunNotFound(id) => write!(f, "run {} not found", id),
            EngineError::WorkUnitNotFound(id) => write!(f, "work unit {} not found", id),
            EngineError::DuplicateRun(id) => {
                write!(f, "pipeline {} already has a run in progress", id)
            }
            EngineError::LockTimeout(which) => {
                write!(f, "could not acquire the {} lock in time", which)
            }
            EngineError::Setup(msg) => write!(f, "run setup failed: {}", msg),
            EngineError::Repository(msg) => write!(f, "{}", msg),
            EngineError::Rpc(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        EngineError::Repository(err.to_string())
    }
}

impl From<RpcError> for EngineError {
    fn from(err: RpcError) -> Self {
        EngineError::Rpc(err)
    }
}

/// The central job run state machine.
pub struct JobRunEngine {
    repo: Arc<dyn Repository>,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<AdapterRegistry>,
    setup_lock: Mutex<()>,
    execute_lock: Mutex<()>,
    lock_timeout: Duration,
}

impl JobRunEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        dispatcher: Arc<dyn Dispatcher>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        Self::with_lock_timeout(repo, dispatcher, registry, Duration::from_secs(30))
    }

    pub fn with_lock_timeout(
        repo: Arc<dyn Repository>,
        dispatcher: Arc<dyn Dispatcher>,
        registry: Arc<AdapterRegistry>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            dispatcher,
            registry,
            setup_lock: Mutex::new(()),
            execute_lock: Mutex::new(()),
            lock_timeout,
        }
    }

    /// Expands a pipeline into a new run with its full work unit batch,
    /// then kicks off the first dispatch scan.
    ///
    /// Fails fast when another non-completed run of the pipeline exists.
    /// Any expansion failure marks the run errored and completed; the lock
    /// is released on every path.
    pub async fn setup_job_run(self: &Arc<Self>, pipeline_id: Uuid) -> Result<Uuid, EngineError> {
        let run_id = {
            let _guard = tokio::time::timeout(self.lock_timeout, self.setup_lock.lock())
                .await
                .map_err(|_| EngineError::LockTimeout("setup"))?;
            self.expand_run(pipeline_id).await?
        };

        self.execute_job_run(run_id).await?;
        Ok(run_id)
    }

    async fn expand_run(&self, pipeline_id: Uuid) -> Result<Uuid, EngineError> {
        let pipeline = self
            .repo
            .find_pipeline(pipeline_id)
            .await?
            .ok_or(EngineError::PipelineNotFound(pipeline_id))?;

        let run = JobRun::new(pipeline_id);
        let run_id = run.id;
        self.repo.create_run(run).await?;
        info!("run {} created for pipeline '{}'", run_id, pipeline.name);

        let others = self
            .repo
            .incomplete_runs_for_pipeline(pipeline_id, run_id)
            .await?;
        if !others.is_empty() {
            let message = format!(
                "pipeline '{}' already has {} unfinished run(s)",
                pipeline.name,
                others.len()
            );
            warn!("{}", message);
            self.fail_run(run_id, &message).await?;
            return Err(EngineError::DuplicateRun(pipeline_id));
        }

        match self.expand_stages(&pipeline, run_id) {
            Ok(units) => {
                info!(
                    "run {} expanded into {} work unit(s) across {} stage(s)",
                    run_id,
                    units.len(),
                    pipeline.stages.len()
                );
                self.repo.insert_work_units(units).await?;
                Ok(run_id)
            }
            Err(message) => {
                error!("run {} expansion failed: {}", run_id, message);
                self.fail_run(run_id, &message).await?;
                Err(EngineError::Setup(message))
            }
        }
    }

    /// Walks the stages in order, feeding each chained stage the units its
    /// upstream stage produced earlier in this same expansion.
    fn expand_stages(&self, pipeline: &Pipeline, run_id: Uuid) -> Result<Vec<WorkUnit>, String> {
        let mut units: Vec<WorkUnit> = Vec::new();

        for stage in pipeline.stages_in_order() {
            let adapter = self
                .registry
                .get(stage.kind)
                .ok_or_else(|| format!("no adapter registered for kind {}", stage.kind))?;

            let previous: Vec<WorkUnit> = match stage.upstream_stage_id {
                Some(upstream_id) => units
                    .iter()
                    .filter(|u| u.stage_id == upstream_id)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };

            let seeds = adapter
                .setup(pipeline, stage, &previous, run_id)
                .map_err(|e| format!("stage {} ({}): {}", stage.stage_order, stage.kind, e))?;

            for (item_order, seed) in seeds.into_iter().enumerate() {
                units.push(seed.into_work_unit(run_id, stage.id, stage.stage_order, item_order as u32));
            }
        }

        Ok(units)
    }

    /// Scans the run's work units and dispatches everything eligible.
    ///
    /// Re-entrant across call sites: cron ticks, manual triggers, and
    /// completion callbacks all funnel here. A lock timeout only means some
    /// other caller is scanning; this one logs and yields. Boxed because
    /// completions re-enter this function through the dispatch tasks it
    /// spawns, and the indirection keeps that call cycle finite.
    pub fn execute_job_run(
        self: &Arc<Self>,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        Box::pin(async move {
            let guard =
                match tokio::time::timeout(self.lock_timeout, self.execute_lock.lock()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        warn!(
                            "run {}: execute lock busy, skipping scan (a later event will rescan)",
                            run_id
                        );
                        return Ok(());
                    }
                };

            let result = self.scan_and_dispatch(run_id).await;
            drop(guard);
            result
        })
    }

    async fn scan_and_dispatch(self: &Arc<Self>, run_id: Uuid) -> Result<(), EngineError> {
        let run = self
            .repo
            .find_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.is_completed() {
            debug!("run {} is already completed, nothing to scan", run_id);
            return Ok(());
        }

        let units = self.repo.work_units_for_run(run_id).await?;
        let any_open = units.iter().any(|u| !u.is_completed());
        if !any_open {
            return self.finalize_run(run, &units).await;
        }

        let pipeline = self
            .repo
            .find_pipeline(run.pipeline_id)
            .await?
            .ok_or(EngineError::PipelineNotFound(run.pipeline_id))?;

        let pending_ids: Vec<Uuid> = units.iter().filter(|u| u.is_pending()).map(|u| u.id).collect();

        for unit_id in pending_ids {
            // Dispatches made earlier in this pass must be visible here.
            let current = self.repo.work_units_for_run(run_id).await?;
            let Some(unit) = current.iter().find(|u| u.id == unit_id) else {
                continue;
            };
            if !unit.is_pending() {
                continue;
            }

            let Some(stage) = pipeline.stage(unit.stage_id) else {
                warn!(
                    "work unit {} references stage {} missing from pipeline '{}'",
                    unit.id, unit.stage_id, pipeline.name
                );
                continue;
            };

            // Same-item predecessor gate, indifferent to its error flag.
            if unit.stage_order > 0 {
                let predecessor_done = current.iter().any(|u| {
                    u.item_name == unit.item_name
                        && u.stage_order == unit.stage_order - 1
                        && u.is_completed()
                });
                if !predecessor_done {
                    continue;
                }
            }

            let running_on_stage = current
                .iter()
                .filter(|u| u.stage_id == stage.id && u.is_running())
                .count();
            if running_on_stage >= stage.parallel as usize {
                continue;
            }

            // Artifact lookup is always scoped to the same item.
            let previous = stage.upstream_stage_id.and_then(|upstream_id| {
                current
                    .iter()
                    .find(|u| {
                        u.stage_id == upstream_id
                            && u.item_name == unit.item_name
                            && u.is_completed()
                    })
                    .cloned()
            });

            let mut started = unit.clone();
            started.started_at = Some(Utc::now());
            self.repo.update_work_unit(started.clone()).await?;

            debug!(
                "run {}: dispatching '{}' stage {} to agent '{}'",
                run_id, started.item_name, started.stage_order, stage.agent_key
            );

            // Fire and forget; the scan keeps going immediately.
            let engine = Arc::clone(self);
            let agent_key = stage.agent_key.clone();
            tokio::spawn(async move {
                engine.dispatch(agent_key, started, previous).await;
            });
        }

        Ok(())
    }

    /// Runs the Run RPC for one started unit and applies the failure
    /// policy: a connectivity failure reverts the unit to pending so the
    /// next scan retries, anything else completes it as errored.
    async fn dispatch(self: Arc<Self>, agent_key: String, unit: WorkUnit, previous: Option<WorkUnit>) {
        match self.dispatcher.run(&agent_key, &unit, previous.as_ref()).await {
            Ok(()) => {}
            Err(RpcError::NotConnected(_)) => {
                warn!(
                    "agent '{}' not connected, work unit {} goes back to pending",
                    agent_key, unit.id
                );
                // A stop may have closed the unit while the call was in
                // flight; a forced completion must never be reopened.
                match self.repo.find_work_unit(unit.id).await {
                    Ok(Some(current)) if !current.is_completed() => {
                        let mut reverted = current;
                        reverted.started_at = None;
                        if let Err(e) = self.repo.update_work_unit(reverted).await {
                            error!("failed to revert work unit to pending: {}", e);
                        }
                    }
                    Ok(Some(_)) => {
                        debug!("work unit {} already completed, leaving it closed", unit.id)
                    }
                    Ok(None) => {}
                    Err(e) => error!("failed to re-read work unit {}: {}", unit.id, e),
                }
            }
            Err(e) => {
                error!("dispatch of work unit {} failed: {}", unit.id, e);
                let message = format!("dispatch failed: {}", e);
                if let Err(e) = self.complete_task(unit.id, &message, None, true).await {
                    error!("failed to record dispatch failure: {}", e);
                }
            }
        }
    }

    /// Records the terminal state of one work unit and rescans its run.
    /// This is how a run advances: event-driven continuation, not polling.
    pub async fn complete_task(
        self: &Arc<Self>,
        work_unit_id: Uuid,
        message: &str,
        artifact: Option<String>,
        is_error: bool,
    ) -> Result<(), EngineError> {
        let mut unit = self
            .repo
            .find_work_unit(work_unit_id)
            .await?
            .ok_or(EngineError::WorkUnitNotFound(work_unit_id))?;

        if unit.is_completed() {
            // Stop already forced this unit closed, or a duplicate event.
            debug!("work unit {} completed twice, keeping first result", unit.id);
            return Ok(());
        }

        if unit.started_at.is_none() {
            unit.started_at = Some(Utc::now());
        }
        unit.completed_at = Some(Utc::now());
        unit.is_error = is_error;
        unit.result_message = Some(message.to_string());
        unit.result_artifact = artifact;
        let run_id = unit.run_id;

        if is_error {
            warn!("work unit {} ('{}') failed: {}", unit.id, unit.item_name, message);
        } else {
            info!("work unit {} ('{}') completed", unit.id, unit.item_name);
        }
        self.repo.update_work_unit(unit).await?;

        self.execute_job_run(run_id).await
    }

    /// Applies a batch of progress telemetry. Progress is informational
    /// only; it never changes run state.
    pub fn progress(&self, events: &[ProgressEvent]) {
        for event in events {
            info!("work unit {}: {}", event.work_unit_id, event.message);
        }
    }

    /// Applies a batch of terminal completions.
    pub async fn complete_batch(self: &Arc<Self>, events: &[CompleteEvent]) {
        for event in events {
            if let Err(e) = self
                .complete_task(
                    event.work_unit_id,
                    &event.message,
                    event.artifact.clone(),
                    event.is_error,
                )
                .await
            {
                warn!("dropping completion for work unit {}: {}", event.work_unit_id, e);
            }
        }
    }

    /// Stops a run: forces every incomplete unit to an error completion,
    /// sends one Stop RPC per unit that was in flight, and finalizes.
    pub async fn stop_job_run(self: &Arc<Self>, run_id: Uuid) -> Result<(), EngineError> {
        let mut run = self
            .repo
            .find_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.is_completed() {
            return Ok(());
        }

        info!("stopping run {}", run_id);
        run.stopped = true;
        self.repo.update_run(run.clone()).await?;

        let pipeline = self.repo.find_pipeline(run.pipeline_id).await?;
        let units = self.repo.work_units_for_run(run_id).await?;
        let in_flight: Vec<WorkUnit> = units.iter().filter(|u| u.is_running()).cloned().collect();

        for unit in units.iter().filter(|u| !u.is_completed()) {
            let mut forced = unit.clone();
            let now = Utc::now();
            if forced.started_at.is_none() {
                forced.started_at = Some(now);
            }
            forced.completed_at = Some(now);
            forced.is_error = true;
            forced.result_message = Some(STOPPED_MESSAGE.to_string());
            self.repo.update_work_unit(forced).await?;
        }

        // Cancel whatever is still executing remotely.
        for unit in in_flight {
            let agent_key = pipeline
                .as_ref()
                .and_then(|p| p.stage(unit.stage_id))
                .map(|s| s.agent_key.clone());
            match agent_key {
                Some(agent_key) => {
                    if let Err(e) = self.dispatcher.stop(&agent_key, unit.id).await {
                        warn!("stop rpc for work unit {} failed: {}", unit.id, e);
                    }
                }
                None => warn!("no owning agent found for in-flight work unit {}", unit.id),
            }
        }

        let units = self.repo.work_units_for_run(run_id).await?;
        self.finalize_run(run, &units).await
    }

    async fn fail_run(&self, run_id: Uuid, message: &str) -> Result<(), EngineError> {
        if let Some(mut run) = self.repo.find_run(run_id).await? {
            let now = Utc::now();
            run.is_error = true;
            run.result_message = Some(message.to_string());
            run.completed_at = Some(now);
            run.run_time_ms = Some((now - run.started_at).num_milliseconds());
            self.repo.update_run(run).await?;
        }
        Ok(())
    }

    async fn finalize_run(&self, mut run: JobRun, units: &[WorkUnit]) -> Result<(), EngineError> {
        let now = Utc::now();
        let total = units.len();
        let failed = units.iter().filter(|u| u.is_error).count();

        run.completed_at = Some(now);
        run.is_error = failed > 0;
        run.result_message = Some(if failed > 0 {
            format!("{} of {} tasks failed", failed, total)
        } else {
            format!("{} tasks completed", total)
        });
        run.run_time_ms = Some((now - run.started_at).num_milliseconds());

        info!(
            "run {} finished: {} ({} ms)",
            run.id,
            run.result_message.as_deref().unwrap_or_default(),
            run.run_time_ms.unwrap_or_default()
        );
        self.repo.update_run(run).await?;
        Ok(())
    }
}
