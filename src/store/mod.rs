//! Durable run storage — the persistence port and its implementations.
//!
//! Every flow execution is a *run*; every node completion appends a *step*
//! carrying the serialized shared state. A2A tasks map one-to-one onto runs,
//! and the latest serialized Task object is kept as a snapshot so
//! `tasks/get` / `tasks/resubscribe` never replay the flow.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MeshResult;
use crate::flow::SharedState;
use crate::types::{Task, TaskState};

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryFlowStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteFlowStore;

/// Node name recorded for the synthetic step 0 of every run.
pub const STEP_A2A_INIT: &str = "A2A_INIT";

/// Node name recorded for the terminal checkpoint of a completed run.
pub const STEP_A2A_FINAL: &str = "A2A_FINAL";

/// Node name recorded for the terminal checkpoint of a failed run.
pub const STEP_A2A_ERROR: &str = "A2A_ERROR";

/// Environment variable selecting the SQLite database location.
pub const DB_PATH_ENV: &str = "POCKETMESH_DB_PATH";

/// Default SQLite database location.
pub const DEFAULT_DB_PATH: &str = "./pocketmesh.sqlite";

/// The persisted record of a single flow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Monotonic run identifier.
    pub id: i64,

    /// Name of the flow (skill) this run executes.
    pub flow_name: String,

    /// ISO-8601 creation timestamp.
    pub created_at: String,

    /// Current run status — mirrors the A2A task state.
    pub status: TaskState,
}

/// One persisted checkpoint of a run.
///
/// Step indexes are dense from 0; the highest-indexed step holds the latest
/// durable shared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Row identifier.
    pub id: i64,

    /// Run this step belongs to.
    pub run_id: i64,

    /// Name of the node that produced this checkpoint (or one of the
    /// `A2A_*` markers).
    pub node_name: String,

    /// The action the node's finalize returned, when applicable.
    pub action: Option<String>,

    /// Zero-based position within the run.
    pub step_index: i64,

    /// The serialized shared state at this point.
    pub shared_state_json: String,

    /// ISO-8601 creation timestamp.
    pub created_at: String,
}

/// Port for durable storage of runs, steps, task→run mappings, and task
/// snapshots.
///
/// Implementations must serialize writes for a given `run_id`; the engine
/// guarantees a single writer per run, so a per-run lock or a single-writer
/// connection suffices.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Create a run in `submitted` status and return its id.
    async fn create_run(&self, flow_name: &str) -> MeshResult<i64>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: i64) -> MeshResult<Option<Run>>;

    /// Update a run's status.
    async fn update_run_status(&self, run_id: i64, status: TaskState) -> MeshResult<()>;

    /// Append a step. `(run_id, step_index)` must be unique; violating that
    /// is a persistence error.
    async fn add_step(
        &self,
        run_id: i64,
        node_name: &str,
        action: Option<&str>,
        step_index: i64,
        shared: &SharedState,
    ) -> MeshResult<i64>;

    /// All steps of a run, ascending by `step_index`.
    async fn get_steps_for_run(&self, run_id: i64) -> MeshResult<Vec<Step>>;

    /// The highest-indexed step of a run.
    async fn get_last_step(&self, run_id: i64) -> MeshResult<Option<Step>>;

    /// A specific step of a run by index.
    async fn get_step_by_index(&self, run_id: i64, step_index: i64) -> MeshResult<Option<Step>>;

    /// Delete a run and, transactionally, its steps, task mappings, and
    /// snapshots.
    async fn delete_run(&self, run_id: i64) -> MeshResult<()>;

    /// Bind a task id to a run (idempotent upsert).
    async fn map_task_to_run(&self, task_id: &str, run_id: i64) -> MeshResult<()>;

    /// The run bound to a task id, if any.
    async fn run_id_for_task(&self, task_id: &str) -> MeshResult<Option<i64>>;

    /// Remove a task mapping and its snapshot.
    async fn delete_task(&self, task_id: &str) -> MeshResult<()>;

    /// Persist the latest serialized Task object for a task id.
    ///
    /// Safe to call before any run is mapped.
    async fn save_task_snapshot(&self, task_id: &str, snapshot: &Task) -> MeshResult<()>;

    /// The latest Task snapshot for a task id.
    async fn get_task_snapshot(&self, task_id: &str) -> MeshResult<Option<Task>>;
}
