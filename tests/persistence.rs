//! Persistence port contract: step indexing, ordering, cascade deletion,
//! task mapping, and snapshots — exercised against both store
//! implementations.

use serde_json::json;

use pocketmesh::flow::SharedState;
use pocketmesh::store::{FlowStore, InMemoryFlowStore, STEP_A2A_INIT};
use pocketmesh::types::{Task, TaskState, TaskStatus};

fn shared_with(key: &str, value: serde_json::Value) -> SharedState {
    let mut shared = SharedState::new();
    shared.insert(key, value);
    shared
}

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

async fn seed_run(store: &dyn FlowStore, flow_name: &str, steps: usize) -> i64 {
    let run_id = store.create_run(flow_name).await.unwrap();
    store
        .add_step(run_id, STEP_A2A_INIT, None, 0, &SharedState::new())
        .await
        .unwrap();
    for i in 1..=steps {
        store
            .add_step(
                run_id,
                &format!("Node{}", i),
                Some("default"),
                i as i64,
                &shared_with("counter", json!(i)),
            )
            .await
            .unwrap();
    }
    run_id
}

// The contract tests run against any FlowStore implementation.

async fn step_indexes_are_dense_from_zero(store: &dyn FlowStore) {
    let run_id = seed_run(store, "dense", 3).await;
    let steps = store.get_steps_for_run(run_id).await.unwrap();
    let indexes: Vec<i64> = steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indexes, vec![0, 1, 2, 3]);
}

async fn duplicate_step_index_is_rejected(store: &dyn FlowStore) {
    let run_id = seed_run(store, "dupe", 1).await;
    let result = store
        .add_step(run_id, "Rogue", None, 1, &SharedState::new())
        .await;
    assert!(result.is_err());

    // The failed insert leaves the run untouched.
    let steps = store.get_steps_for_run(run_id).await.unwrap();
    assert_eq!(steps.len(), 2);
}

async fn last_and_indexed_step_lookups(store: &dyn FlowStore) {
    let run_id = seed_run(store, "lookup", 2).await;

    let last = store.get_last_step(run_id).await.unwrap().unwrap();
    assert_eq!(last.step_index, 2);
    assert_eq!(last.node_name, "Node2");

    let first = store.get_step_by_index(run_id, 0).await.unwrap().unwrap();
    assert_eq!(first.node_name, STEP_A2A_INIT);
    assert!(first.action.is_none());

    assert!(store.get_step_by_index(run_id, 9).await.unwrap().is_none());
}

async fn shared_state_round_trips_through_steps(store: &dyn FlowStore) {
    let run_id = store.create_run("roundtrip").await.unwrap();
    let mut shared = SharedState::new();
    shared.insert("nested", json!({"a": [1, 2, 3], "b": "text"}));
    shared.set_a2a_context("t1", "ctx1", "echo");
    store
        .add_step(run_id, STEP_A2A_INIT, None, 0, &shared)
        .await
        .unwrap();

    let step = store.get_last_step(run_id).await.unwrap().unwrap();
    let loaded = SharedState::from_json_str(&step.shared_state_json).unwrap();
    assert_eq!(loaded, shared);
}

async fn run_status_updates_persist(store: &dyn FlowStore) {
    let run_id = store.create_run("status").await.unwrap();
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, TaskState::Submitted);

    store
        .update_run_status(run_id, TaskState::Working)
        .await
        .unwrap();
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, TaskState::Working);

    assert!(store.update_run_status(9999, TaskState::Failed).await.is_err());
}

async fn delete_run_cascades_to_steps_mappings_and_snapshots(store: &dyn FlowStore) {
    let run_id = seed_run(store, "cascade", 2).await;
    store.map_task_to_run("t1", run_id).await.unwrap();
    store
        .save_task_snapshot("t1", &make_task("t1", TaskState::Working))
        .await
        .unwrap();

    store.delete_run(run_id).await.unwrap();

    assert!(store.get_run(run_id).await.unwrap().is_none());
    assert!(store.get_steps_for_run(run_id).await.unwrap().is_empty());
    assert!(store.run_id_for_task("t1").await.unwrap().is_none());
}

async fn task_mapping_is_an_idempotent_upsert(store: &dyn FlowStore) {
    let run_a = store.create_run("a").await.unwrap();
    let run_b = store.create_run("b").await.unwrap();

    store.map_task_to_run("t1", run_a).await.unwrap();
    store.map_task_to_run("t1", run_a).await.unwrap();
    assert_eq!(store.run_id_for_task("t1").await.unwrap(), Some(run_a));

    // Remapping moves the binding.
    store.map_task_to_run("t1", run_b).await.unwrap();
    assert_eq!(store.run_id_for_task("t1").await.unwrap(), Some(run_b));
}

async fn snapshots_overwrite_and_delete(store: &dyn FlowStore) {
    store
        .save_task_snapshot("t1", &make_task("t1", TaskState::Working))
        .await
        .unwrap();
    store
        .save_task_snapshot("t1", &make_task("t1", TaskState::Completed))
        .await
        .unwrap();

    let snapshot = store.get_task_snapshot("t1").await.unwrap().unwrap();
    assert_eq!(snapshot.status.state, TaskState::Completed);

    store.delete_task("t1").await.unwrap();
    assert!(store.get_task_snapshot("t1").await.unwrap().is_none());
}

async fn run_ids_are_monotonic(store: &dyn FlowStore) {
    let first = store.create_run("one").await.unwrap();
    let second = store.create_run("two").await.unwrap();
    assert!(second > first);
}

macro_rules! store_contract_tests {
    ($module:ident, $make_store:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn step_indexes_dense() {
                let store = $make_store;
                super::step_indexes_are_dense_from_zero(&store).await;
            }

            #[tokio::test]
            async fn duplicate_index_rejected() {
                let store = $make_store;
                super::duplicate_step_index_is_rejected(&store).await;
            }

            #[tokio::test]
            async fn step_lookups() {
                let store = $make_store;
                super::last_and_indexed_step_lookups(&store).await;
            }

            #[tokio::test]
            async fn shared_state_round_trip() {
                let store = $make_store;
                super::shared_state_round_trips_through_steps(&store).await;
            }

            #[tokio::test]
            async fn run_status() {
                let store = $make_store;
                super::run_status_updates_persist(&store).await;
            }

            #[tokio::test]
            async fn cascade_delete() {
                let store = $make_store;
                super::delete_run_cascades_to_steps_mappings_and_snapshots(&store).await;
            }

            #[tokio::test]
            async fn mapping_upsert() {
                let store = $make_store;
                super::task_mapping_is_an_idempotent_upsert(&store).await;
            }

            #[tokio::test]
            async fn snapshots() {
                let store = $make_store;
                super::snapshots_overwrite_and_delete(&store).await;
            }

            #[tokio::test]
            async fn monotonic_run_ids() {
                let store = $make_store;
                super::run_ids_are_monotonic(&store).await;
            }
        }
    };
}

store_contract_tests!(in_memory, InMemoryFlowStore::new());

#[cfg(feature = "sqlite")]
store_contract_tests!(
    sqlite,
    pocketmesh::store::SqliteFlowStore::connect_in_memory()
        .await
        .unwrap()
);
