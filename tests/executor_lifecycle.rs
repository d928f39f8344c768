//! End-to-end executor behavior over the event bus and the persisted run:
//! event ordering, durable steps, final-message composition, artifact
//! normalization, failure handling, hook cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use pocketmesh::builders::AgentCardBuilder;
use pocketmesh::error::{MeshError, MeshResult};
use pocketmesh::flow::{
    Action, Flow, Node, Params, SharedState, KEY_FINAL_RESPONSE_PARTS,
};
use pocketmesh::server::{EventBus, FlowExecutor, RequestContext, TaskStore};
use pocketmesh::store::{FlowStore, InMemoryFlowStore};
use pocketmesh::types::{AgentCard, Message, Part, StreamResponse, TaskState};
use pocketmesh::utils::get_message_text;

// ---- Fixtures ----

struct EchoNode;

#[async_trait]
impl Node for EchoNode {
    fn name(&self) -> &str {
        "EchoNode"
    }

    async fn finalize(
        &self,
        shared: &mut SharedState,
        _prep: &Value,
        _exec: &Value,
        _params: &Params,
    ) -> MeshResult<Action> {
        let text = shared
            .incoming_message()
            .map(|m| get_message_text(&m, "\n"))
            .unwrap_or_default();
        shared.insert("lastEcho", Value::String(format!("Echo: {}", text)));
        Ok(Some("default".to_string()))
    }
}

struct FinalPartsNode;

#[async_trait]
impl Node for FinalPartsNode {
    fn name(&self) -> &str {
        "FinalPartsNode"
    }

    async fn finalize(
        &self,
        shared: &mut SharedState,
        _prep: &Value,
        _exec: &Value,
        _params: &Params,
    ) -> MeshResult<Action> {
        shared.insert(
            KEY_FINAL_RESPONSE_PARTS,
            json!([{"kind": "text", "text": "from parts"}]),
        );
        shared.insert("lastEcho", Value::String("shadowed".to_string()));
        Ok(None)
    }
}

struct NoOutputNode;

#[async_trait]
impl Node for NoOutputNode {
    fn name(&self) -> &str {
        "NoOutputNode"
    }
}

struct FailingNode;

#[async_trait]
impl Node for FailingNode {
    fn name(&self) -> &str {
        "FailingNode"
    }

    async fn execute(
        &self,
        _prep: &Value,
        _shared: &SharedState,
        _params: &Params,
        _attempt: u32,
    ) -> MeshResult<Value> {
        Err(MeshError::Other("node exploded".to_string()))
    }
}

/// Emits a legacy `type`-tagged artifact with no artifact id.
struct LegacyArtifactNode;

#[async_trait]
impl Node for LegacyArtifactNode {
    fn name(&self) -> &str {
        "LegacyArtifactNode"
    }

    async fn execute(
        &self,
        _prep: &Value,
        _shared: &SharedState,
        _params: &Params,
        _attempt: u32,
    ) -> MeshResult<Value> {
        Ok(json!({
            "__a2a_artifact": {
                "name": "legacy",
                "parts": [{"type": "text", "text": "old shape"}]
            }
        }))
    }
}

fn single_node_flow(name: &str, node: impl Node + 'static) -> Flow {
    let mut flow = Flow::new(name);
    flow.add_node(node);
    flow
}

fn test_card() -> AgentCard {
    AgentCardBuilder::new("Test Agent", "Engine under test", "0.1.0")
        .url("http://localhost:7420/a2a")
        .skill("echo", "Echo", "Echoes the inbound text", vec![])
        .streaming(true)
        .build()
}

fn user_message(text: &str, skill: &str) -> Message {
    let mut message = Message::user(Uuid::new_v4().to_string(), text);
    message.metadata = Some(json!({ "skillId": skill }));
    message
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<StreamResponse>) -> Vec<StreamResponse> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---- Scenario: echo success ----

#[tokio::test]
async fn echo_flow_produces_ordered_events_and_steps() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(
        Arc::clone(&store) as Arc<dyn FlowStore>,
        test_card(),
    );
    executor.register_skill("echo", single_node_flow("echo", EchoNode));

    let bus = EventBus::with_default_capacity();
    let mut rx = bus.subscribe();

    let ctx = RequestContext::new("task-1", "ctx-1", user_message("hello", "echo"));
    executor.execute(ctx, &bus).await.unwrap();
    assert!(bus.is_finished());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 5, "expected 5 events, got {:?}", events.len());

    // 1. Initial task event, submitted.
    match &events[0] {
        StreamResponse::Task(task) => {
            assert_eq!(task.id, "task-1");
            assert_eq!(task.status.state, TaskState::Submitted);
            assert_eq!(task.metadata.as_ref().unwrap()["skillId"], "echo");
            assert_eq!(task.history.as_ref().unwrap().len(), 1);
        }
        other => panic!("expected task event, got {:?}", other),
    }

    // 2. Working status for the node start.
    match &events[1] {
        StreamResponse::StatusUpdate(update) => {
            assert_eq!(update.status.state, TaskState::Working);
            assert!(!update.r#final);
            let text = get_message_text(update.status.message.as_ref().unwrap(), "\n");
            assert!(text.contains("Starting node EchoNode"), "got: {}", text);
            assert_eq!(update.metadata.as_ref().unwrap()["node"], "EchoNode");
        }
        other => panic!("expected status-update, got {:?}", other),
    }

    // 3. Working status for the node completion (never `completed` at the
    //    A2A layer — only the executor emits terminal states).
    match &events[2] {
        StreamResponse::StatusUpdate(update) => {
            assert_eq!(update.status.state, TaskState::Working);
            assert!(!update.r#final);
        }
        other => panic!("expected status-update, got {:?}", other),
    }

    // 4. The final agent message with the echo.
    match &events[3] {
        StreamResponse::Message(message) => {
            assert_eq!(get_message_text(message, "\n"), "Echo: hello");
        }
        other => panic!("expected message, got {:?}", other),
    }

    // 5. Terminal status update.
    match &events[4] {
        StreamResponse::StatusUpdate(update) => {
            assert_eq!(update.status.state, TaskState::Completed);
            assert!(update.r#final);
        }
        other => panic!("expected terminal status-update, got {:?}", other),
    }

    // Durable steps: A2A_INIT, EchoNode, A2A_FINAL with dense indexes.
    let run_id = store.run_id_for_task("task-1").await.unwrap().unwrap();
    let steps = store.get_steps_for_run(run_id).await.unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.node_name.as_str()).collect();
    assert_eq!(names, vec!["A2A_INIT", "EchoNode", "A2A_FINAL"]);
    let indexes: Vec<i64> = steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(steps[2].action.as_deref(), Some("completed"));

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, TaskState::Completed);

    // Snapshot reflects the terminal task.
    let snapshot = executor.task_store().get("task-1").await.unwrap().unwrap();
    assert_eq!(snapshot.status.state, TaskState::Completed);
    let history = snapshot.history.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(get_message_text(&history[1], "\n"), "Echo: hello");
}

#[tokio::test]
async fn hooks_are_cleared_after_execute() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(store as Arc<dyn FlowStore>, test_card());
    executor.register_skill("echo", single_node_flow("echo", EchoNode));

    let bus = EventBus::with_default_capacity();
    let ctx = RequestContext::new("task-1", "ctx-1", user_message("hi", "echo"));
    executor.execute(ctx, &bus).await.unwrap();

    let flow = executor.flow_for_skill("echo").unwrap();
    let hooks = flow.hooks();
    assert!(hooks.on_status_update.is_none());
    assert!(hooks.on_artifact.is_none());
    assert!(hooks.cancel_flag.is_none());
}

// ---- Final message composition precedence ----

#[tokio::test]
async fn final_response_parts_take_precedence_over_last_echo() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(store as Arc<dyn FlowStore>, test_card());
    executor.register_skill("echo", single_node_flow("echo", FinalPartsNode));

    let bus = EventBus::with_default_capacity();
    let mut rx = bus.subscribe();
    let ctx = RequestContext::new("task-1", "ctx-1", user_message("hi", "echo"));
    executor.execute(ctx, &bus).await.unwrap();

    let events = drain(&mut rx);
    let message = events
        .iter()
        .find_map(|e| match e {
            StreamResponse::Message(m) => Some(m.clone()),
            _ => None,
        })
        .expect("message event");
    assert_eq!(get_message_text(&message, "\n"), "from parts");
}

#[tokio::test]
async fn flow_without_output_falls_back_to_default_text() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(store as Arc<dyn FlowStore>, test_card());
    executor.register_skill("echo", single_node_flow("echo", NoOutputNode));

    let bus = EventBus::with_default_capacity();
    let mut rx = bus.subscribe();
    let ctx = RequestContext::new("task-1", "ctx-1", user_message("hi", "echo"));
    executor.execute(ctx, &bus).await.unwrap();

    let events = drain(&mut rx);
    let message = events
        .iter()
        .find_map(|e| match e {
            StreamResponse::Message(m) => Some(m.clone()),
            _ => None,
        })
        .expect("message event");
    assert_eq!(get_message_text(&message, "\n"), "Flow completed.");
}

// ---- Failure path ----

#[tokio::test]
async fn failing_node_yields_terminal_failed_event_and_error_step() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(
        Arc::clone(&store) as Arc<dyn FlowStore>,
        test_card(),
    );
    executor.register_skill("echo", single_node_flow("echo", FailingNode));

    let bus = EventBus::with_default_capacity();
    let mut rx = bus.subscribe();
    let ctx = RequestContext::new("task-1", "ctx-1", user_message("boom", "echo"));
    executor.execute(ctx, &bus).await.unwrap();

    let events = drain(&mut rx);
    let last = events.last().expect("events");
    match last {
        StreamResponse::StatusUpdate(update) => {
            assert_eq!(update.status.state, TaskState::Failed);
            assert!(update.r#final);
            let text = get_message_text(update.status.message.as_ref().unwrap(), "\n");
            assert!(
                text.starts_with("PocketMesh flow failed: "),
                "got: {}",
                text
            );
        }
        other => panic!("expected terminal failed status, got {:?}", other),
    }
    // No message event on failure.
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamResponse::Message(_))));

    let run_id = store.run_id_for_task("task-1").await.unwrap().unwrap();
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, TaskState::Failed);

    let steps = store.get_steps_for_run(run_id).await.unwrap();
    let last_step = steps.last().unwrap();
    assert_eq!(last_step.node_name, "A2A_ERROR");
    assert_eq!(last_step.action.as_deref(), Some("failed"));

    let snapshot = executor.task_store().get("task-1").await.unwrap().unwrap();
    assert_eq!(snapshot.status.state, TaskState::Failed);
    let history = snapshot.history.unwrap();
    let error_text = get_message_text(history.last().unwrap(), "\n");
    assert!(error_text.starts_with("PocketMesh flow failed: "));
}

// ---- Skill resolution ----

#[tokio::test]
async fn unknown_skill_is_rejected_before_any_run() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(
        Arc::clone(&store) as Arc<dyn FlowStore>,
        test_card(),
    );
    executor.register_skill("echo", single_node_flow("echo", EchoNode));

    let bus = EventBus::with_default_capacity();
    let mut rx = bus.subscribe();
    let ctx = RequestContext::new("task-1", "ctx-1", user_message("hi", "nope"));

    let err = executor.execute(ctx, &bus).await.unwrap_err();
    assert!(matches!(err, MeshError::SkillNotFound(_)));
    assert!(drain(&mut rx).is_empty());
    assert!(store.run_id_for_task("task-1").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_skill_metadata_falls_back_to_first_card_skill() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(store as Arc<dyn FlowStore>, test_card());
    executor.register_skill("echo", single_node_flow("echo", EchoNode));

    let bus = EventBus::with_default_capacity();
    let mut rx = bus.subscribe();
    // No skillId in metadata — the card's first skill ("echo") applies.
    let message = Message::user("m1", "hello");
    let ctx = RequestContext::new("task-1", "ctx-1", message);
    executor.execute(ctx, &bus).await.unwrap();

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamResponse::Message(_))));
}

// ---- Artifact normalization ----

#[tokio::test]
async fn legacy_artifacts_are_normalized_before_publishing() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(store as Arc<dyn FlowStore>, test_card());
    executor.register_skill("echo", single_node_flow("echo", LegacyArtifactNode));

    let bus = EventBus::with_default_capacity();
    let mut rx = bus.subscribe();
    let ctx = RequestContext::new("task-1", "ctx-1", user_message("hi", "echo"));
    executor.execute(ctx, &bus).await.unwrap();

    let events = drain(&mut rx);
    let artifact_event = events
        .iter()
        .find_map(|e| match e {
            StreamResponse::ArtifactUpdate(a) => Some(a.clone()),
            _ => None,
        })
        .expect("artifact-update event");

    assert!(!artifact_event.artifact.artifact_id.is_empty());
    assert!(matches!(
        artifact_event.artifact.parts[0],
        Part::Text { .. }
    ));

    // The wire shape uses `kind`, never the legacy `type` tag.
    let value = serde_json::to_value(&artifact_event).unwrap();
    assert_eq!(value["artifact"]["parts"][0]["kind"], "text");
    assert!(value["artifact"]["parts"][0].get("type").is_none());

    // The snapshot carries the accumulated artifact.
    let snapshot = executor.task_store().get("task-1").await.unwrap().unwrap();
    let artifacts = snapshot.artifacts.expect("artifacts on snapshot");
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name.as_deref(), Some("legacy"));
}

// ---- Multi-turn history ----

#[tokio::test]
async fn second_request_resumes_and_appends_distinct_message() {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(
        Arc::clone(&store) as Arc<dyn FlowStore>,
        test_card(),
    );
    executor.register_skill("echo", single_node_flow("echo", EchoNode));

    let bus = EventBus::with_default_capacity();
    let ctx = RequestContext::new("task-1", "ctx-1", user_message("first", "echo"));
    executor.execute(ctx, &bus).await.unwrap();

    let bus2 = EventBus::with_default_capacity();
    let mut rx2 = bus2.subscribe();
    let ctx2 = RequestContext::new("task-1", "ctx-1", user_message("second", "echo"));
    executor.execute(ctx2, &bus2).await.unwrap();

    // The resumed run's initial task event reports `working`, not
    // `submitted`.
    let events = drain(&mut rx2);
    match &events[0] {
        StreamResponse::Task(task) => assert_eq!(task.status.state, TaskState::Working),
        other => panic!("expected task event, got {:?}", other),
    }

    let snapshot = executor.task_store().get("task-1").await.unwrap().unwrap();
    let history = snapshot.history.unwrap();
    // first, Echo: first, second, Echo: second
    assert_eq!(history.len(), 4);
    assert_eq!(get_message_text(&history[2], "\n"), "second");
    assert_eq!(get_message_text(&history[3], "\n"), "Echo: second");
}
