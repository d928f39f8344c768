//! In-memory flow store backed by `HashMap`s.
//!
//! Suitable for tests and short-lived embedders. All run data is lost when
//! the process exits. Thread-safe via `tokio::sync::RwLock`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::flow::SharedState;
use crate::types::{Task, TaskState};

use super::{FlowStore, Run, Step};

#[derive(Default)]
struct Tables {
    runs: HashMap<i64, Run>,
    steps: HashMap<i64, Vec<Step>>,
    task_map: HashMap<String, i64>,
    snapshots: HashMap<String, Task>,
    next_run_id: i64,
    next_step_id: i64,
}

/// In-memory implementation of [`FlowStore`].
#[derive(Default)]
pub struct InMemoryFlowStore {
    tables: RwLock<Tables>,
}

impl InMemoryFlowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn create_run(&self, flow_name: &str) -> MeshResult<i64> {
        let mut tables = self.tables.write().await;
        tables.next_run_id += 1;
        let id = tables.next_run_id;
        tables.runs.insert(
            id,
            Run {
                id,
                flow_name: flow_name.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
                status: TaskState::Submitted,
            },
        );
        tables.steps.insert(id, Vec::new());
        debug!(run_id = id, flow_name = %flow_name, "Run created");
        Ok(id)
    }

    async fn get_run(&self, run_id: i64) -> MeshResult<Option<Run>> {
        let tables = self.tables.read().await;
        Ok(tables.runs.get(&run_id).cloned())
    }

    async fn update_run_status(&self, run_id: i64, status: TaskState) -> MeshResult<()> {
        let mut tables = self.tables.write().await;
        match tables.runs.get_mut(&run_id) {
            Some(run) => {
                run.status = status;
                Ok(())
            }
            None => Err(MeshError::Persistence(format!("run {} not found", run_id))),
        }
    }

    async fn add_step(
        &self,
        run_id: i64,
        node_name: &str,
        action: Option<&str>,
        step_index: i64,
        shared: &SharedState,
    ) -> MeshResult<i64> {
        let shared_state_json = shared.to_json_string()?;
        let mut tables = self.tables.write().await;
        tables.next_step_id += 1;
        let id = tables.next_step_id;

        let steps = tables
            .steps
            .get_mut(&run_id)
            .ok_or_else(|| MeshError::Persistence(format!("run {} not found", run_id)))?;

        if steps.iter().any(|s| s.step_index == step_index) {
            return Err(MeshError::Persistence(format!(
                "duplicate step_index {} for run {}",
                step_index, run_id
            )));
        }

        steps.push(Step {
            id,
            run_id,
            node_name: node_name.to_string(),
            action: action.map(String::from),
            step_index,
            shared_state_json,
            created_at: chrono::Utc::now().to_rfc3339(),
        });
        steps.sort_by_key(|s| s.step_index);

        debug!(run_id, node_name = %node_name, step_index, "Step added");
        Ok(id)
    }

    async fn get_steps_for_run(&self, run_id: i64) -> MeshResult<Vec<Step>> {
        let tables = self.tables.read().await;
        Ok(tables.steps.get(&run_id).cloned().unwrap_or_default())
    }

    async fn get_last_step(&self, run_id: i64) -> MeshResult<Option<Step>> {
        let tables = self.tables.read().await;
        Ok(tables
            .steps
            .get(&run_id)
            .and_then(|steps| steps.last().cloned()))
    }

    async fn get_step_by_index(&self, run_id: i64, step_index: i64) -> MeshResult<Option<Step>> {
        let tables = self.tables.read().await;
        Ok(tables.steps.get(&run_id).and_then(|steps| {
            steps
                .iter()
                .find(|s| s.step_index == step_index)
                .cloned()
        }))
    }

    async fn delete_run(&self, run_id: i64) -> MeshResult<()> {
        let mut tables = self.tables.write().await;
        if tables.runs.remove(&run_id).is_none() {
            warn!(run_id, "Attempted to delete non-existent run");
            return Ok(());
        }
        tables.steps.remove(&run_id);

        let task_ids: Vec<String> = tables
            .task_map
            .iter()
            .filter(|(_, &rid)| rid == run_id)
            .map(|(tid, _)| tid.clone())
            .collect();
        for task_id in task_ids {
            tables.task_map.remove(&task_id);
            tables.snapshots.remove(&task_id);
        }

        debug!(run_id, "Run deleted with steps, mappings, and snapshots");
        Ok(())
    }

    async fn map_task_to_run(&self, task_id: &str, run_id: i64) -> MeshResult<()> {
        let mut tables = self.tables.write().await;
        tables.task_map.insert(task_id.to_string(), run_id);
        Ok(())
    }

    async fn run_id_for_task(&self, task_id: &str) -> MeshResult<Option<i64>> {
        let tables = self.tables.read().await;
        Ok(tables.task_map.get(task_id).copied())
    }

    async fn delete_task(&self, task_id: &str) -> MeshResult<()> {
        let mut tables = self.tables.write().await;
        tables.task_map.remove(task_id);
        tables.snapshots.remove(task_id);
        Ok(())
    }

    async fn save_task_snapshot(&self, task_id: &str, snapshot: &Task) -> MeshResult<()> {
        let mut tables = self.tables.write().await;
        tables.snapshots.insert(task_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn get_task_snapshot(&self, task_id: &str) -> MeshResult<Option<Task>> {
        let tables = self.tables.read().await;
        Ok(tables.snapshots.get(task_id).cloned())
    }
}
