//! JSON-RPC method layer: send, stream, get, cancel, resubscribe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use pocketmesh::builders::AgentCardBuilder;
use pocketmesh::error::{MeshError, MeshResult};
use pocketmesh::flow::{Action, Flow, Node, Params, SharedState};
use pocketmesh::server::{FlowExecutor, MeshRequestHandler, RequestHandler};
use pocketmesh::store::{FlowStore, InMemoryFlowStore, STEP_A2A_INIT};
use pocketmesh::types::{
    AgentCard, GetTaskParams, Message, SendMessageParams, SendMessageResponse, StreamResponse,
    TaskIdParams, TaskState,
};
use pocketmesh::utils::get_message_text;

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
        shared.insert("lastEcho", json!(format!("Echo: {}", text)));
        Ok(None)
    }
}

fn test_card() -> AgentCard {
    AgentCardBuilder::new("Handler Agent", "Handler tests", "0.1.0")
        .url("http://localhost:7420/a2a")
        .skill("echo", "Echo", "Echoes the inbound text", vec![])
        .streaming(true)
        .build()
}

fn handler_with_store() -> (MeshRequestHandler, Arc<InMemoryFlowStore>) {
    let store = Arc::new(InMemoryFlowStore::new());
    let mut executor = FlowExecutor::new(
        Arc::clone(&store) as Arc<dyn FlowStore>,
        test_card(),
    );
    let mut flow = Flow::new("echo");
    flow.add_node(EchoNode);
    executor.register_skill("echo", flow);
    (MeshRequestHandler::new(Arc::new(executor)), store)
}

fn send_params(text: &str, task_id: Option<&str>) -> SendMessageParams {
    let mut message = Message::user(Uuid::new_v4().to_string(), text);
    message.metadata = Some(json!({ "skillId": "echo" }));
    message.task_id = task_id.map(String::from);
    SendMessageParams {
        message,
        configuration: None,
        metadata: None,
    }
}

#[tokio::test]
async fn message_send_returns_completed_task() {
    let (handler, _store) = handler_with_store();

    let response = handler
        .on_message_send(send_params("hello", Some("task-1")))
        .await
        .unwrap();

    let task = match response {
        SendMessageResponse::Task(task) => task,
        SendMessageResponse::Message(_) => panic!("expected task"),
    };
    assert_eq!(task.id, "task-1");
    assert_eq!(task.status.state, TaskState::Completed);
    let history = task.history.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(get_message_text(&history[1], "\n"), "Echo: hello");
}

#[tokio::test]
async fn message_send_with_unknown_skill_is_invalid_params() {
    let (handler, _store) = handler_with_store();

    let mut params = send_params("hello", None);
    params.message.metadata = Some(json!({ "skillId": "nope" }));

    let err = handler.on_message_send(params).await.unwrap_err();
    assert!(matches!(err, MeshError::SkillNotFound(_)));
    assert_eq!(err.code(), pocketmesh::error::INVALID_PARAMS);
}

#[tokio::test]
async fn message_stream_yields_events_until_final() {
    let (handler, _store) = handler_with_store();

    let mut rx = handler
        .on_message_send_stream(send_params("hello", Some("task-1")))
        .await
        .unwrap();

    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("stream timed out")
            .expect("stream closed early");
        let is_final = event.is_final();
        events.push(event);
        if is_final {
            break;
        }
    }

    assert!(matches!(events.first(), Some(StreamResponse::Task(_))));
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamResponse::Message(_))));
    match events.last().unwrap() {
        StreamResponse::StatusUpdate(update) => {
            assert_eq!(update.status.state, TaskState::Completed);
            assert!(update.r#final);
        }
        other => panic!("expected terminal status-update, got {:?}", other),
    }
}

#[tokio::test]
async fn stream_with_unknown_skill_fails_before_streaming() {
    let (handler, store) = handler_with_store();

    let mut params = send_params("hello", Some("task-1"));
    params.message.metadata = Some(json!({ "skillId": "nope" }));

    let err = handler.on_message_send_stream(params).await.unwrap_err();
    assert!(matches!(err, MeshError::SkillNotFound(_)));
    assert!(store.run_id_for_task("task-1").await.unwrap().is_none());
}

#[tokio::test]
async fn get_task_returns_snapshot_and_trims_history() {
    let (handler, _store) = handler_with_store();

    handler
        .on_message_send(send_params("hello", Some("task-1")))
        .await
        .unwrap();

    let task = handler
        .on_get_task(GetTaskParams {
            id: "task-1".to_string(),
            history_length: None,
            metadata: None,
        })
        .await
        .unwrap();
    assert_eq!(task.history.as_ref().unwrap().len(), 2);

    let trimmed = handler
        .on_get_task(GetTaskParams {
            id: "task-1".to_string(),
            history_length: Some(1),
            metadata: None,
        })
        .await
        .unwrap();
    let history = trimmed.history.unwrap();
    assert_eq!(history.len(), 1);
    // The tail is kept.
    assert_eq!(get_message_text(&history[0], "\n"), "Echo: hello");
}

#[tokio::test]
async fn get_task_unknown_id_is_task_not_found() {
    let (handler, _store) = handler_with_store();

    let err = handler
        .on_get_task(GetTaskParams {
            id: "missing".to_string(),
            history_length: None,
            metadata: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::TaskNotFound { .. }));
    assert_eq!(err.code(), pocketmesh::error::TASK_NOT_FOUND);
}

#[tokio::test]
async fn get_task_reconstructs_from_last_step_without_snapshot() {
    let (handler, store) = handler_with_store();

    // Seed a run + mapping + step directly, with no snapshot saved.
    let run_id = store.create_run("echo").await.unwrap();
    store.map_task_to_run("task-9", run_id).await.unwrap();
    store
        .update_run_status(run_id, TaskState::Working)
        .await
        .unwrap();
    let mut shared = SharedState::new();
    shared
        .set_history(&[Message::user("m1", "hi there")])
        .unwrap();
    shared.set_a2a_context("task-9", "ctx-9", "echo");
    store
        .add_step(run_id, STEP_A2A_INIT, None, 0, &shared)
        .await
        .unwrap();

    let task = handler
        .on_get_task(GetTaskParams {
            id: "task-9".to_string(),
            history_length: None,
            metadata: None,
        })
        .await
        .unwrap();

    assert_eq!(task.id, "task-9");
    assert_eq!(task.context_id, "ctx-9");
    assert_eq!(task.status.state, TaskState::Working);
    assert_eq!(task.history.as_ref().unwrap().len(), 1);
    assert_eq!(task.metadata.as_ref().unwrap()["skillId"], "echo");
}

#[tokio::test]
async fn cancel_terminal_task_is_not_cancelable() {
    let (handler, _store) = handler_with_store();

    handler
        .on_message_send(send_params("hello", Some("task-1")))
        .await
        .unwrap();

    let err = handler
        .on_cancel_task(TaskIdParams {
            id: "task-1".to_string(),
            metadata: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::TaskNotCancelable { .. }));
    assert_eq!(err.code(), pocketmesh::error::TASK_NOT_CANCELABLE);
}

#[tokio::test]
async fn cancel_unknown_task_is_task_not_found() {
    let (handler, _store) = handler_with_store();

    let err = handler
        .on_cancel_task(TaskIdParams {
            id: "missing".to_string(),
            metadata: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::TaskNotFound { .. }));
}

#[tokio::test]
async fn resubscribe_replays_snapshot_and_terminates() {
    let (handler, _store) = handler_with_store();

    handler
        .on_message_send(send_params("hello", Some("task-1")))
        .await
        .unwrap();

    let mut rx = handler
        .on_resubscribe_to_task(TaskIdParams {
            id: "task-1".to_string(),
            metadata: None,
        })
        .await
        .unwrap();

    let replay = rx.recv().await.unwrap();
    match &replay {
        StreamResponse::Task(task) => {
            assert_eq!(task.id, "task-1");
            assert_eq!(task.status.state, TaskState::Completed);
            assert!(task.history.is_some());
        }
        other => panic!("expected task replay, got {:?}", other),
    }
    // A terminal snapshot is itself the final event.
    assert!(replay.is_final());
    assert!(rx.recv().await.is_err());
}

#[tokio::test]
async fn resubscribe_unknown_task_is_task_not_found() {
    let (handler, _store) = handler_with_store();

    let err = handler
        .on_resubscribe_to_task(TaskIdParams {
            id: "missing".to_string(),
            metadata: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::TaskNotFound { .. }));
}
