//! SQLite-backed flow store.
//!
//! The durable implementation of [`FlowStore`]: three tables (`runs`,
//! `steps`, `a2a_tasks`), created on connect. The database location comes
//! from the `POCKETMESH_DB_PATH` environment variable, defaulting to
//! `./pocketmesh.sqlite`. Shared state and task snapshots are stored as
//! opaque UTF-8 JSON blobs.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{MeshError, MeshResult};
use crate::flow::SharedState;
use crate::types::{Task, TaskState};

use super::{FlowStore, Run, Step, DB_PATH_ENV, DEFAULT_DB_PATH};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flow_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    node_name TEXT NOT NULL,
    action TEXT,
    step_index INTEGER NOT NULL,
    shared_state_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(run_id, step_index)
);

CREATE TABLE IF NOT EXISTS a2a_tasks (
    task_id TEXT PRIMARY KEY,
    run_id INTEGER REFERENCES runs(id),
    snapshot_json TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id, step_index);
"#;

/// SQLite implementation of [`FlowStore`] over an sqlx connection pool.
#[derive(Clone)]
pub struct SqliteFlowStore {
    pool: SqlitePool,
}

impl SqliteFlowStore {
    /// Open (creating if missing) the database at the configured location:
    /// `POCKETMESH_DB_PATH` when set, `./pocketmesh.sqlite` otherwise.
    pub async fn connect_default() -> MeshResult<Self> {
        let path = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        Self::connect(&path).await
    }

    /// Open (creating if missing) the database at `path`.
    pub async fn connect(path: &str) -> MeshResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(perr)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        debug!(path = %path, "SQLite flow store opened");
        Ok(store)
    }

    /// Open an in-memory database (single connection — each SQLite
    /// in-memory connection is its own database).
    pub async fn connect_in_memory() -> MeshResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(perr)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool (schema is still ensured).
    pub async fn from_pool(pool: SqlitePool) -> MeshResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> MeshResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(perr)?;
        Ok(())
    }
}

fn perr(err: sqlx::Error) -> MeshError {
    MeshError::Persistence(err.to_string())
}

fn run_from_row(row: &SqliteRow) -> MeshResult<Run> {
    let status: String = row.try_get("status").map_err(perr)?;
    Ok(Run {
        id: row.try_get("id").map_err(perr)?,
        flow_name: row.try_get("flow_name").map_err(perr)?,
        created_at: row.try_get("created_at").map_err(perr)?,
        status: TaskState::parse_or_unknown(&status),
    })
}

fn step_from_row(row: &SqliteRow) -> MeshResult<Step> {
    Ok(Step {
        id: row.try_get("id").map_err(perr)?,
        run_id: row.try_get("run_id").map_err(perr)?,
        node_name: row.try_get("node_name").map_err(perr)?,
        action: row.try_get("action").map_err(perr)?,
        step_index: row.try_get("step_index").map_err(perr)?,
        shared_state_json: row.try_get("shared_state_json").map_err(perr)?,
        created_at: row.try_get("created_at").map_err(perr)?,
    })
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    async fn create_run(&self, flow_name: &str) -> MeshResult<i64> {
        let result = sqlx::query(
            "INSERT INTO runs (flow_name, created_at, status) VALUES (?, ?, ?)",
        )
        .bind(flow_name)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(TaskState::Submitted.to_string())
        .execute(&self.pool)
        .await
        .map_err(perr)?;

        let id = result.last_insert_rowid();
        debug!(run_id = id, flow_name = %flow_name, "Run created");
        Ok(id)
    }

    async fn get_run(&self, run_id: i64) -> MeshResult<Option<Run>> {
        let row = sqlx::query("SELECT id, flow_name, created_at, status FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(perr)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn update_run_status(&self, run_id: i64, status: TaskState) -> MeshResult<()> {
        let result = sqlx::query("UPDATE runs SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(perr)?;
        if result.rows_affected() == 0 {
            return Err(MeshError::Persistence(format!("run {} not found", run_id)));
        }
        Ok(())
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
        let result = sqlx::query(
            "INSERT INTO steps (run_id, node_name, action, step_index, shared_state_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(node_name)
        .bind(action)
        .bind(step_index)
        .bind(shared_state_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(perr)?;

        debug!(run_id, node_name = %node_name, step_index, "Step added");
        Ok(result.last_insert_rowid())
    }

    async fn get_steps_for_run(&self, run_id: i64) -> MeshResult<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, run_id, node_name, action, step_index, shared_state_json, created_at \
             FROM steps WHERE run_id = ? ORDER BY step_index ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(perr)?;
        rows.iter().map(step_from_row).collect()
    }

    async fn get_last_step(&self, run_id: i64) -> MeshResult<Option<Step>> {
        let row = sqlx::query(
            "SELECT id, run_id, node_name, action, step_index, shared_state_json, created_at \
             FROM steps WHERE run_id = ? ORDER BY step_index DESC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(perr)?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn get_step_by_index(&self, run_id: i64, step_index: i64) -> MeshResult<Option<Step>> {
        let row = sqlx::query(
            "SELECT id, run_id, node_name, action, step_index, shared_state_json, created_at \
             FROM steps WHERE run_id = ? AND step_index = ?",
        )
        .bind(run_id)
        .bind(step_index)
        .fetch_optional(&self.pool)
        .await
        .map_err(perr)?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn delete_run(&self, run_id: i64) -> MeshResult<()> {
        let mut tx = self.pool.begin().await.map_err(perr)?;

        sqlx::query("DELETE FROM steps WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(perr)?;
        sqlx::query("DELETE FROM a2a_tasks WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(perr)?;
        sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(perr)?;

        tx.commit().await.map_err(perr)?;
        debug!(run_id, "Run deleted with steps, mappings, and snapshots");
        Ok(())
    }

    async fn map_task_to_run(&self, task_id: &str, run_id: i64) -> MeshResult<()> {
        sqlx::query(
            "INSERT INTO a2a_tasks (task_id, run_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(task_id) DO UPDATE SET run_id = excluded.run_id",
        )
        .bind(task_id)
        .bind(run_id)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(perr)?;
        Ok(())
    }

    async fn run_id_for_task(&self, task_id: &str) -> MeshResult<Option<i64>> {
        let row = sqlx::query("SELECT run_id FROM a2a_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(perr)?;
        match row {
            Some(row) => row.try_get::<Option<i64>, _>("run_id").map_err(perr),
            None => Ok(None),
        }
    }

    async fn delete_task(&self, task_id: &str) -> MeshResult<()> {
        sqlx::query("DELETE FROM a2a_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(perr)?;
        Ok(())
    }

    async fn save_task_snapshot(&self, task_id: &str, snapshot: &Task) -> MeshResult<()> {
        let snapshot_json = serde_json::to_string(snapshot)
            .map_err(|e| MeshError::Persistence(format!("failed to serialize snapshot: {}", e)))?;
        sqlx::query(
            "INSERT INTO a2a_tasks (task_id, run_id, snapshot_json, created_at) \
             VALUES (?, NULL, ?, ?) \
             ON CONFLICT(task_id) DO UPDATE SET snapshot_json = excluded.snapshot_json",
        )
        .bind(task_id)
        .bind(snapshot_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(perr)?;
        Ok(())
    }

    async fn get_task_snapshot(&self, task_id: &str) -> MeshResult<Option<Task>> {
        let row = sqlx::query("SELECT snapshot_json FROM a2a_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(perr)?;
        let json: Option<String> = match row {
            Some(row) => row.try_get("snapshot_json").map_err(perr)?,
            None => None,
        };
        match json {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| MeshError::Persistence(format!("corrupt snapshot: {}", e))),
            None => Ok(None),
        }
    }
}
