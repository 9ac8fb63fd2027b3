//! Work unit executor
//!
//! Runs dispatched work units through the adapter registry. Admission is
//! serialized with a bounded wait, each running unit holds a cancellation
//! token in the in-flight table, and every accepted unit produces exactly
//! one terminal completion event regardless of how it exits: success,
//! failure, stop, or deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use backhaul_core::adapter::{AdapterRegistry, ProgressSink, TaskAdapter, TaskError};
use backhaul_core::domain::{Stage, TaskKind, WorkUnit};
use backhaul_core::rpc::{ASSIGNMENT_NOT_READY, Assignment, CompleteEvent, ProgressEvent};

use crate::telemetry::TelemetryBuffer;

/// Extra time an adapter gets to observe its cancellation token before the
/// executor abandons it outright.
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

pub struct AgentExecutor {
    registry: Arc<AdapterRegistry>,
    telemetry: Arc<TelemetryBuffer>,
    /// Assignment snapshot from the last fetch; stage definitions for
    /// dispatched units are resolved against it.
    assignment: RwLock<Option<Assignment>>,
    /// Serializes dispatch admission.
    dispatch_lock: tokio::sync::Mutex<()>,
    /// Cancellation tokens of units currently running, by work unit id.
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
    default_timeout: Duration,
    dispatch_wait: Duration,
}

impl AgentExecutor {
    pub fn new(registry: Arc<AdapterRegistry>, telemetry: Arc<TelemetryBuffer>) -> Self {
        Self::with_timings(
            registry,
            telemetry,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
    }

    pub fn with_timings(
        registry: Arc<AdapterRegistry>,
        telemetry: Arc<TelemetryBuffer>,
        default_timeout: Duration,
        dispatch_wait: Duration,
    ) -> Self {
        Self {
            registry,
            telemetry,
            assignment: RwLock::new(None),
            dispatch_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(HashMap::new()),
            default_timeout,
            dispatch_wait,
        }
    }

    /// Replaces the assignment snapshot after a fetch.
    pub fn set_assignment(&self, assignment: Assignment) {
        if let Ok(mut slot) = self.assignment.write() {
            *slot = Some(assignment);
        }
    }

    /// Whether an assignment snapshot has been installed yet.
    pub fn has_assignment(&self) -> bool {
        self.assignment
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Accepts one dispatched work unit and starts it in the background.
    ///
    /// Returns an error string (the RPC reply) only when admission fails or
    /// the assignment has not loaded yet; problems with the unit itself are
    /// reported as error completions so the run records what went wrong.
    pub async fn handle_run(
        self: &Arc<Self>,
        unit: WorkUnit,
        previous: Option<WorkUnit>,
    ) -> Result<(), String> {
        let _admit = tokio::time::timeout(self.dispatch_wait, self.dispatch_lock.lock())
            .await
            .map_err(|_| "dispatch admission timed out".to_string())?;

        // Run can race the assignment fetch right after (re)connecting.
        // Reject with the retryable error instead of failing the unit.
        if !self.has_assignment() {
            debug!(
                "work unit {} arrived before the assignment, rejecting for retry",
                unit.id
            );
            return Err(ASSIGNMENT_NOT_READY.to_string());
        }

        {
            let in_flight = self.in_flight.lock().map_err(|e| e.to_string())?;
            if in_flight.contains_key(&unit.id) {
                debug!("work unit {} is already running, ignoring redelivery", unit.id);
                return Ok(());
            }
        }

        let stage = match self.stage_for(&unit) {
            Some(stage) => stage,
            None => {
                warn!("no stage definition for work unit {}", unit.id);
                self.telemetry.push_complete(CompleteEvent::new(
                    unit.id,
                    format!("agent has no definition for stage {}", unit.stage_id),
                    None,
                    true,
                ));
                return Ok(());
            }
        };

        let adapter = match self.registry.get(stage.kind) {
            Some(adapter) => adapter,
            None => {
                warn!("no adapter registered for kind {}", stage.kind);
                self.telemetry.push_complete(CompleteEvent::new(
                    unit.id,
                    format!("no adapter registered for kind {}", stage.kind),
                    None,
                    true,
                ));
                return Ok(());
            }
        };

        let deadline = stage
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let token = CancellationToken::new();
        self.in_flight
            .lock()
            .map_err(|e| e.to_string())?
            .insert(unit.id, token.clone());

        info!(
            "starting work unit {} ('{}', stage {} of kind {})",
            unit.id, unit.item_name, unit.stage_order, stage.kind
        );
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor
                .run_unit(adapter, stage, unit, previous, token, deadline)
                .await;
        });
        Ok(())
    }

    async fn run_unit(
        self: Arc<Self>,
        adapter: Arc<dyn TaskAdapter>,
        stage: Stage,
        unit: WorkUnit,
        previous: Option<WorkUnit>,
        token: CancellationToken,
        deadline: Duration,
    ) {
        // The deadline fires through the same token a Stop uses, so an
        // adapter only ever has one cancellation signal to observe.
        let timed_out = Arc::new(AtomicBool::new(false));
        {
            let token = token.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        let (sink, mut progress_rx) = ProgressSink::channel();
        let forwarder = {
            let telemetry = Arc::clone(&self.telemetry);
            let work_unit_id = unit.id;
            tokio::spawn(async move {
                while let Some(message) = progress_rx.recv().await {
                    telemetry.push_progress(ProgressEvent::new(work_unit_id, message));
                }
            })
        };

        let result = tokio::time::timeout(
            deadline + DEADLINE_GRACE,
            adapter.run(&stage, &unit, previous.as_ref(), sink, token.clone()),
        )
        .await;

        let event = match result {
            Ok(Ok(output)) => CompleteEvent::new(unit.id, output.message, output.artifact, false),
            Ok(Err(TaskError::Cancelled)) if timed_out.load(Ordering::SeqCst) => {
                CompleteEvent::new(unit.id, TaskError::TimedOut.to_string(), None, true)
            }
            Ok(Err(e)) => CompleteEvent::new(unit.id, e.to_string(), None, true),
            Err(_) => {
                warn!(
                    "work unit {} ignored its cancellation token past the deadline",
                    unit.id
                );
                CompleteEvent::new(unit.id, TaskError::TimedOut.to_string(), None, true)
            }
        };

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&unit.id);
        }
        token.cancel();
        forwarder.await.ok();

        if event.is_error {
            warn!("work unit {} finished with error: {}", unit.id, event.message);
        } else {
            info!("work unit {} finished: {}", unit.id, event.message);
        }
        self.telemetry.push_complete(event);
    }

    /// Cancels a running work unit. Unknown ids are a no-op; the unit may
    /// already have completed by the time the stop arrives.
    pub fn handle_stop(&self, work_unit_id: Uuid) {
        let token = self
            .in_flight
            .lock()
            .ok()
            .and_then(|m| m.get(&work_unit_id).cloned());
        match token {
            Some(token) => {
                info!("stopping work unit {}", work_unit_id);
                token.cancel();
            }
            None => debug!("stop for work unit {} which is not running", work_unit_id),
        }
    }

    pub async fn test_connection(
        &self,
        kind: TaskKind,
        settings: &HashMap<String, serde_json::Value>,
    ) -> Result<String, String> {
        let adapter = self
            .registry
            .get(kind)
            .ok_or_else(|| format!("no adapter registered for kind {}", kind))?;
        adapter.test_connection(settings).await.map_err(|e| e.to_string())
    }

    pub async fn list_databases(
        &self,
        kind: TaskKind,
        settings: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<String>, String> {
        let adapter = self
            .registry
            .get(kind)
            .ok_or_else(|| format!("no adapter registered for kind {}", kind))?;
        adapter.list_databases(settings).await.map_err(|e| e.to_string())
    }

    fn stage_for(&self, unit: &WorkUnit) -> Option<Stage> {
        self.assignment
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|a| a.stage(unit.stage_id).cloned()))
    }
}
