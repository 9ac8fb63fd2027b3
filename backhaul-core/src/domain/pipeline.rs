//! Pipeline domain types
//!
//! A pipeline is an ordered list of stages executed together on trigger.
//! Structure shared between coordinator (persists, expands) and agent
//! (executes individual stages).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    /// Opaque cron expression; parsing and ticking happen outside the core.
    pub schedule: Option<String>,
    pub priority: i32,
    pub active: bool,
    /// Stages ordered by `stage_order`.
    pub stages: Vec<Stage>,
}

/// One pipeline step with a kind, concurrency limit, and optional upstream
/// artifact source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub kind: TaskKind,
    /// 0-based position within the pipeline.
    pub stage_order: u32,
    /// Max work units of this stage running at the same time.
    pub parallel: u32,
    /// Earlier stage whose per-item artifact this stage consumes.
    /// Must reference a strictly earlier `stage_order`.
    pub upstream_stage_id: Option<Uuid>,
    pub timeout_seconds: Option<u64>,
    /// Kind-specific settings, interpreted by the matching adapter.
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
    /// The agent that owns and executes this stage.
    pub agent_key: String,
}

/// Enumerated task type, closed on purpose: an unknown kind fails at
/// configuration load, not at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    CreateBackup,
    Compress,
    Upload,
    Delete,
    Restore,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::CreateBackup => write!(f, "CreateBackup"),
            TaskKind::Compress => write!(f, "Compress"),
            TaskKind::Upload => write!(f, "Upload"),
            TaskKind::Delete => write!(f, "Delete"),
            TaskKind::Restore => write!(f, "Restore"),
        }
    }
}

impl Pipeline {
    /// Validates the structural invariants of the stage list.
    ///
    /// Checked at configuration load so a malformed definition never reaches
    /// run expansion.
    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err(format!("pipeline '{}' has no stages", self.name));
        }

        let mut orders: Vec<u32> = self.stages.iter().map(|s| s.stage_order).collect();
        orders.sort_unstable();
        for (expected, order) in orders.iter().enumerate() {
            if *order != expected as u32 {
                return Err(format!(
                    "pipeline '{}' stage orders are not contiguous from 0 (found {})",
                    self.name, order
                ));
            }
        }

        for stage in &self.stages {
            if stage.parallel == 0 {
                return Err(format!(
                    "stage {} of pipeline '{}' has parallel = 0",
                    stage.stage_order, self.name
                ));
            }
            if stage.agent_key.is_empty() {
                return Err(format!(
                    "stage {} of pipeline '{}' has no agent",
                    stage.stage_order, self.name
                ));
            }
            if let Some(upstream_id) = stage.upstream_stage_id {
                let upstream = self
                    .stages
                    .iter()
                    .find(|s| s.id == upstream_id)
                    .ok_or_else(|| {
                        format!(
                            "stage {} of pipeline '{}' references unknown upstream stage {}",
                            stage.stage_order, self.name, upstream_id
                        )
                    })?;
                if upstream.stage_order >= stage.stage_order {
                    return Err(format!(
                        "stage {} of pipeline '{}' references upstream stage {} which is not strictly earlier",
                        stage.stage_order, self.name, upstream.stage_order
                    ));
                }
            }
        }

        Ok(())
    }

    /// Stages sorted by their order, the sequence run expansion walks.
    pub fn stages_in_order(&self) -> Vec<&Stage> {
        let mut stages: Vec<&Stage> = self.stages.iter().collect();
        stages.sort_by_key(|s| s.stage_order);
        stages
    }

    pub fn stage(&self, stage_id: Uuid) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }
}

impl Stage {
    /// Reads a required string setting, for adapters.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    /// Reads a string-array setting, for adapters.
    pub fn setting_list(&self, key: &str) -> Vec<String> {
        self.settings
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(order: u32, upstream: Option<Uuid>) -> Stage {
        Stage {
            id: Uuid::new_v4(),
            pipeline_id: Uuid::nil(),
            kind: TaskKind::CreateBackup,
            stage_order: order,
            parallel: 1,
            upstream_stage_id: upstream,
            timeout_seconds: None,
            settings: HashMap::new(),
            agent_key: "agent-1".to_string(),
        }
    }

    fn pipeline(stages: Vec<Stage>) -> Pipeline {
        Pipeline {
            id: Uuid::new_v4(),
            name: "nightly".to_string(),
            schedule: None,
            priority: 0,
            active: true,
            stages,
        }
    }

    #[test]
    fn test_validate_accepts_chained_stages() {
        let a = stage(0, None);
        let b = stage(1, Some(a.id));
        assert!(pipeline(vec![a, b]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_pipeline() {
        assert!(pipeline(vec![]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_gap_in_stage_orders() {
        let p = pipeline(vec![stage(0, None), stage(2, None)]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_forward_upstream_reference() {
        let b = stage(1, None);
        let a = stage(0, Some(b.id));
        assert!(pipeline(vec![a, b]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_self_upstream() {
        let mut a = stage(0, None);
        a.upstream_stage_id = Some(a.id);
        assert!(pipeline(vec![a]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_parallel() {
        let mut a = stage(0, None);
        a.parallel = 0;
        assert!(pipeline(vec![a]).validate().is_err());
    }

    #[test]
    fn test_stages_in_order_sorts_by_stage_order() {
        let a = stage(1, None);
        let b = stage(0, None);
        let p = pipeline(vec![a, b]);
        let ordered = p.stages_in_order();
        assert_eq!(ordered[0].stage_order, 0);
        assert_eq!(ordered[1].stage_order, 1);
    }
}
