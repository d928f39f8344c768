//! Task store — adapts the persistence port to the server's task contract.
//!
//! `save` writes the serialized Task snapshot and, when a run is mapped to
//! the task, mirrors the task's status onto the run row so the two layers
//! never drift. `get` reads the snapshot back without touching runs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::MeshResult;
use crate::store::FlowStore;
use crate::types::Task;

/// Trait for persisting and retrieving A2A tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Save or update a task. Overwrites an existing snapshot.
    async fn save(&self, task: Task) -> MeshResult<()>;

    /// Retrieve a task by its ID. `None` when the task does not exist.
    async fn get(&self, task_id: &str) -> MeshResult<Option<Task>>;
}

/// [`TaskStore`] over a [`FlowStore`], mirroring task status to the mapped
/// run.
pub struct PersistedTaskStore {
    store: Arc<dyn FlowStore>,
}

impl PersistedTaskStore {
    /// Create a task store over the given persistence port.
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskStore for PersistedTaskStore {
    async fn save(&self, task: Task) -> MeshResult<()> {
        self.store.save_task_snapshot(&task.id, &task).await?;

        // Mirror task status onto the run, when one is mapped. Saving a
        // snapshot with no mapped run is legal.
        if let Some(run_id) = self.store.run_id_for_task(&task.id).await? {
            self.store
                .update_run_status(run_id, task.status.state)
                .await?;
        }

        debug!(task_id = %task.id, state = %task.status.state, "Task snapshot saved");
        Ok(())
    }

    async fn get(&self, task_id: &str) -> MeshResult<Option<Task>> {
        let task = self.store.get_task_snapshot(task_id).await?;
        debug!(task_id = %task_id, found = task.is_some(), "Task snapshot lookup");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryFlowStore;
    use crate::types::{TaskState, TaskStatus};

    fn make_task(id: &str, state: TaskState) -> Task {
        Task {
            id: id.to_string(),
            context_id: "ctx1".to_string(),
            kind: "task".to_string(),
            status: TaskStatus::new(state),
            artifacts: None,
            history: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn save_without_mapped_run_still_writes_snapshot() {
        let store = Arc::new(InMemoryFlowStore::new());
        let task_store = PersistedTaskStore::new(store);

        task_store
            .save(make_task("t1", TaskState::Submitted))
            .await
            .unwrap();
        let loaded = task_store.get("t1").await.unwrap().unwrap();
        assert_eq!(loaded.status.state, TaskState::Submitted);
    }

    #[tokio::test]
    async fn save_mirrors_status_to_mapped_run() {
        let store = Arc::new(InMemoryFlowStore::new());
        let run_id = store.create_run("echo").await.unwrap();
        store.map_task_to_run("t1", run_id).await.unwrap();

        let task_store = PersistedTaskStore::new(Arc::clone(&store) as Arc<dyn FlowStore>);
        task_store
            .save(make_task("t1", TaskState::Completed))
            .await
            .unwrap();

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, TaskState::Completed);
    }

    #[tokio::test]
    async fn get_never_mutates_runs() {
        let store = Arc::new(InMemoryFlowStore::new());
        let task_store = PersistedTaskStore::new(Arc::clone(&store) as Arc<dyn FlowStore>);

        assert!(task_store.get("missing").await.unwrap().is_none());
        assert!(store.run_id_for_task("missing").await.unwrap().is_none());
    }
}
