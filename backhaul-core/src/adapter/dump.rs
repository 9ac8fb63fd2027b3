//! Reference create-backup adapter
//!
//! Writes a block-structured dump file per database into a configured
//! output directory. Stands in for a real database connector; the file
//! layout only matters to the downstream reference adapters.
//!
//! Settings:
//! - `databases`: array of database names, one work unit each (required)
//! - `output_dir`: directory receiving the dump files (required at run)
//! - `blocks`: number of payload blocks per dump (default 4)
//! - `block_delay_ms`: pause between blocks, for exercising cancellation

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::run::WorkUnitSeed;
use crate::domain::{Pipeline, Stage, TaskKind, WorkUnit};

use super::{ProgressSink, TaskAdapter, TaskError, TaskOutput};

const DEFAULT_BLOCKS: u64 = 4;

pub struct DumpAdapter;

impl DumpAdapter {
    pub fn new() -> Self {
        Self
    }

    fn databases(settings: &HashMap<String, Value>) -> Vec<String> {
        settings
            .get("databases")
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

impl Default for DumpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskAdapter for DumpAdapter {
    fn kind(&self) -> TaskKind {
        TaskKind::CreateBackup
    }

    fn setup(
        &self,
        _pipeline: &Pipeline,
        stage: &Stage,
        _previous: &[WorkUnit],
        _run_id: Uuid,
    ) -> Result<Vec<WorkUnitSeed>, TaskError> {
        let databases = Self::databases(&stage.settings);
        if databases.is_empty() {
            return Err(TaskError::Validation(
                "create-backup stage has no databases configured".to_string(),
            ));
        }
        Ok(databases.into_iter().map(WorkUnitSeed::new).collect())
    }

    async fn run(
        &self,
        stage: &Stage,
        unit: &WorkUnit,
        _previous: Option<&WorkUnit>,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError> {
        let output_dir = stage
            .setting_str("output_dir")
            .ok_or_else(|| TaskError::Validation("output_dir is not set".to_string()))?;
        let blocks = stage
            .settings
            .get("blocks")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_BLOCKS);
        let block_delay = stage
            .settings
            .get("block_delay_ms")
            .and_then(|v| v.as_u64())
            .map(std::time::Duration::from_millis);

        let path = PathBuf::from(output_dir).join(format!("{}-{}.bak", unit.item_name, unit.run_id));

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| TaskError::Failed(format!("cannot create output_dir: {}", e)))?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| TaskError::Failed(format!("cannot create dump file: {}", e)))?;

        file.write_all(format!("backhaul-dump v1 {}\n", unit.item_name).as_bytes())
            .await
            .map_err(|e| TaskError::Failed(format!("write failed: {}", e)))?;

        for block in 0..blocks {
            if cancel.is_cancelled() {
                // Partial dump is never a valid artifact.
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(TaskError::Cancelled);
            }
            if let Some(delay) = block_delay {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        drop(file);
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(TaskError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            file.write_all(format!("block {:04} {}\n", block, unit.item_name).as_bytes())
                .await
                .map_err(|e| TaskError::Failed(format!("write failed: {}", e)))?;
            progress.send(format!(
                "{}: dumped block {}/{}",
                unit.item_name,
                block + 1,
                blocks
            ));
        }

        file.flush()
            .await
            .map_err(|e| TaskError::Failed(format!("flush failed: {}", e)))?;

        let artifact = path.to_string_lossy().into_owned();
        Ok(TaskOutput::new(
            format!("backed up {} ({} blocks)", unit.item_name, blocks),
            Some(artifact),
        ))
    }

    async fn test_connection(
        &self,
        settings: &HashMap<String, Value>,
    ) -> Result<String, TaskError> {
        let output_dir = settings
            .get("output_dir")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskError::Validation("output_dir is not set".to_string()))?;
        match tokio::fs::metadata(output_dir).await {
            Ok(meta) if meta.is_dir() => Ok(format!("output_dir '{}' is writable", output_dir)),
            Ok(_) => Err(TaskError::Failed(format!(
                "'{}' exists but is not a directory",
                output_dir
            ))),
            Err(e) => Err(TaskError::Failed(format!(
                "cannot access '{}': {}",
                output_dir, e
            ))),
        }
    }

    async fn list_databases(
        &self,
        settings: &HashMap<String, Value>,
    ) -> Result<Vec<String>, TaskError> {
        let databases = Self::databases(settings);
        if databases.is_empty() {
            return Err(TaskError::Failed(
                "no databases configured for this connection".to_string(),
            ));
        }
        Ok(databases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump_stage(settings: HashMap<String, Value>) -> Stage {
        Stage {
            id: Uuid::new_v4(),
            pipeline_id: Uuid::nil(),
            kind: TaskKind::CreateBackup,
            stage_order: 0,
            parallel: 2,
            upstream_stage_id: None,
            timeout_seconds: None,
            settings,
            agent_key: "vault-1".to_string(),
        }
    }

    fn pipeline_with(stage: Stage) -> Pipeline {
        Pipeline {
            id: Uuid::new_v4(),
            name: "nightly".to_string(),
            schedule: None,
            priority: 0,
            active: true,
            stages: vec![stage],
        }
    }

    #[test]
    fn test_setup_emits_one_seed_per_database() {
        let mut settings = HashMap::new();
        settings.insert("databases".to_string(), serde_json::json!(["sales", "orders"]));
        let stage = dump_stage(settings);
        let pipeline = pipeline_with(stage.clone());

        let seeds = DumpAdapter::new()
            .setup(&pipeline, &stage, &[], Uuid::new_v4())
            .unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].item_name, "sales");
        assert_eq!(seeds[1].item_name, "orders");
    }

    #[test]
    fn test_setup_without_databases_is_validation_error() {
        let stage = dump_stage(HashMap::new());
        let pipeline = pipeline_with(stage.clone());
        assert!(matches!(
            DumpAdapter::new().setup(&pipeline, &stage, &[], Uuid::new_v4()),
            Err(TaskError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_run_writes_dump_and_returns_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = HashMap::new();
        settings.insert(
            "output_dir".to_string(),
            serde_json::json!(dir.path().to_string_lossy()),
        );
        settings.insert("blocks".to_string(), serde_json::json!(2));
        let stage = dump_stage(settings);
        let unit = WorkUnitSeed::new("sales").into_work_unit(Uuid::new_v4(), stage.id, 0, 0);

        let output = DumpAdapter::new()
            .run(
                &stage,
                &unit,
                None,
                ProgressSink::discard(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let artifact = output.artifact.expect("dump should publish an artifact");
        let content = std::fs::read_to_string(&artifact).unwrap();
        assert!(content.starts_with("backhaul-dump v1 sales"));
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_run_without_output_dir_is_validation_error() {
        let stage = dump_stage(HashMap::new());
        let unit = WorkUnitSeed::new("sales").into_work_unit(Uuid::new_v4(), stage.id, 0, 0);
        let err = DumpAdapter::new()
            .run(
                &stage,
                &unit,
                None,
                ProgressSink::discard(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancelled_run_removes_partial_dump() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = HashMap::new();
        settings.insert(
            "output_dir".to_string(),
            serde_json::json!(dir.path().to_string_lossy()),
        );
        settings.insert("blocks".to_string(), serde_json::json!(50));
        settings.insert("block_delay_ms".to_string(), serde_json::json!(20));
        let stage = dump_stage(settings);
        let unit = WorkUnitSeed::new("sales").into_work_unit(Uuid::new_v4(), stage.id, 0, 0);

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let err = DumpAdapter::new()
            .run(&stage, &unit, None, ProgressSink::discard(), cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err, TaskError::Cancelled);
        // No partial file left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_list_databases_returns_configured_names() {
        let mut settings = HashMap::new();
        settings.insert("databases".to_string(), serde_json::json!(["sales"]));
        let list = DumpAdapter::new().list_databases(&settings).await.unwrap();
        assert_eq!(list, vec!["sales".to_string()]);
    }
}
