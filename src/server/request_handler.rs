//! Request handler — maps A2A JSON-RPC methods onto the flow executor.
//!
//! The [`RequestHandler`] trait is what the transport layer calls for each
//! JSON-RPC method; [`MeshRequestHandler`] is the standard implementation
//! wiring the [`FlowExecutor`], per-task event buses, and the task store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};
use crate::types::{
    GetTaskParams, SendMessageParams, SendMessageResponse, StreamResponse, Task, TaskIdParams,
    TaskStatus,
};

use super::event_bus::EventBus;
use super::executor::{FlowExecutor, RequestContext};
use super::task_store::TaskStore;

/// Trait for handling A2A JSON-RPC requests. Each method corresponds to a
/// protocol method; the transport layer dispatches to these.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle `message/send` (legacy `tasks/send`) — run the flow to
    /// completion and return the final task.
    async fn on_message_send(&self, params: SendMessageParams) -> MeshResult<SendMessageResponse>;

    /// Handle `message/stream` (legacy `tasks/sendSubscribe`) — run the
    /// flow and return the live event stream.
    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> MeshResult<broadcast::Receiver<StreamResponse>>;

    /// Handle `tasks/get` — return the persisted task snapshot, or
    /// reconstruct it from the last step when no snapshot exists.
    async fn on_get_task(&self, params: GetTaskParams) -> MeshResult<Task>;

    /// Handle `tasks/cancel` — trigger cooperative cancel.
    async fn on_cancel_task(&self, params: TaskIdParams) -> MeshResult<Task>;

    /// Handle `tasks/resubscribe` — replay the snapshot's terminal event
    /// and terminate the stream.
    async fn on_resubscribe_to_task(
        &self,
        params: TaskIdParams,
    ) -> MeshResult<broadcast::Receiver<StreamResponse>>;
}

/// Standard [`RequestHandler`] over a [`FlowExecutor`].
pub struct MeshRequestHandler {
    executor: Arc<FlowExecutor>,
    /// Event buses of in-flight executions, keyed by task id, so
    /// `tasks/cancel` can publish into the stream the client is watching.
    running: Arc<Mutex<HashMap<String, EventBus>>>,
}

impl MeshRequestHandler {
    /// Create a handler over the given executor.
    pub fn new(executor: Arc<FlowExecutor>) -> Self {
        Self {
            executor,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve (or mint) the task/context identifiers for a request.
    fn request_context(params: &SendMessageParams) -> RequestContext {
        let task_id = params
            .message
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context_id = params
            .message
            .context_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut message = params.message.clone();
        message.task_id = Some(task_id.clone());
        message.context_id = Some(context_id.clone());

        RequestContext {
            task_id,
            context_id,
            message,
            metadata: params.metadata.clone(),
        }
    }

    /// Trim task history to the most recent `max_length` messages.
    fn trim_history(task: &mut Task, max_length: Option<i32>) {
        if let Some(max) = max_length {
            if max > 0 {
                if let Some(ref mut history) = task.history {
                    let max = max as usize;
                    if history.len() > max {
                        let start = history.len() - max;
                        *history = history.split_off(start);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for MeshRequestHandler {
    async fn on_message_send(&self, params: SendMessageParams) -> MeshResult<SendMessageResponse> {
        let ctx = Self::request_context(&params);
        let task_id = ctx.task_id.clone();

        let bus = EventBus::with_default_capacity();
        {
            let mut running = self.running.lock().await;
            running.insert(task_id.clone(), bus.clone());
        }

        let result = self.executor.execute(ctx, &bus).await;

        {
            let mut running = self.running.lock().await;
            running.remove(&task_id);
        }
        result?;

        let task = self
            .executor
            .task_store()
            .get(&task_id)
            .await?
            .ok_or_else(|| {
                MeshError::internal_error(format!(
                    "execution finished but no snapshot exists for task {}",
                    task_id
                ))
            })?;

        let mut task = task;
        let history_length = params.configuration.as_ref().and_then(|c| c.history_length);
        Self::trim_history(&mut task, history_length);

        Ok(SendMessageResponse::Task(task))
    }

    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> MeshResult<broadcast::Receiver<StreamResponse>> {
        // Surface SkillNotFound as a JSON-RPC error before any run or
        // stream exists.
        self.executor.validate_skill(&params.message)?;

        let ctx = Self::request_context(&params);
        let task_id = ctx.task_id.clone();

        let bus = EventBus::with_default_capacity();
        let rx = bus.subscribe();
        {
            let mut running = self.running.lock().await;
            running.insert(task_id.clone(), bus.clone());
        }

        let executor = Arc::clone(&self.executor);
        let spawned_bus = bus.clone();
        let running = Arc::clone(&self.running);
        let spawned_task_id = task_id.clone();

        tokio::spawn(async move {
            if let Err(err) = executor.execute(ctx, &spawned_bus).await {
                warn!(task_id = %spawned_task_id, error = %err, "Streaming execution failed");
            }
            let mut running = running.lock().await;
            running.remove(&spawned_task_id);
        });

        Ok(rx)
    }

    async fn on_get_task(&self, params: GetTaskParams) -> MeshResult<Task> {
        if let Some(mut task) = self.executor.task_store().get(&params.id).await? {
            Self::trim_history(&mut task, params.history_length);
            return Ok(task);
        }

        // No snapshot — reconstruct from the persisted run.
        let store = self.executor.store();
        let run_id = store
            .run_id_for_task(&params.id)
            .await?
            .ok_or_else(|| MeshError::task_not_found(params.id.clone()))?;
        let run = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| MeshError::task_not_found(params.id.clone()))?;
        let last = store.get_last_step(run_id).await?.ok_or_else(|| {
            MeshError::Persistence(format!("run {} has no persisted steps", run_id))
        })?;
        let shared = crate::flow::SharedState::from_json_str(&last.shared_state_json)?;

        debug!(task_id = %params.id, run_id, "Reconstructing task from last step");
        let artifacts = shared.artifacts();
        let mut task = Task {
            id: params.id.clone(),
            context_id: shared.context_id().unwrap_or_default().to_string(),
            kind: "task".to_string(),
            status: TaskStatus::new(run.status),
            artifacts: (!artifacts.is_empty()).then_some(artifacts),
            history: Some(shared.history()),
            metadata: shared
                .skill_id()
                .map(|skill| serde_json::json!({ "skillId": skill })),
        };
        Self::trim_history(&mut task, params.history_length);
        Ok(task)
    }

    async fn on_cancel_task(&self, params: TaskIdParams) -> MeshResult<Task> {
        let task = self
            .executor
            .task_store()
            .get(&params.id)
            .await?
            .ok_or_else(|| MeshError::task_not_found(params.id.clone()))?;

        if task.status.state.is_terminal() {
            return Err(MeshError::task_not_cancelable(format!(
                "Task cannot be canceled - current state: {}",
                task.status.state
            )));
        }

        // Publish into the stream the client is watching, when one exists.
        let bus = {
            let running = self.running.lock().await;
            running
                .get(&params.id)
                .cloned()
                .unwrap_or_else(EventBus::with_default_capacity)
        };

        self.executor.cancel_task(&params.id, &bus).await?;

        self.executor
            .task_store()
            .get(&params.id)
            .await?
            .ok_or_else(|| MeshError::task_not_found(params.id.clone()))
    }

    async fn on_resubscribe_to_task(
        &self,
        params: TaskIdParams,
    ) -> MeshResult<broadcast::Receiver<StreamResponse>> {
        let task = self
            .executor
            .task_store()
            .get(&params.id)
            .await?
            .ok_or_else(|| MeshError::task_not_found(params.id.clone()))?;

        // Replay the snapshot (history + status) and terminate. A terminal
        // task is itself the final event; a non-terminal one is followed by
        // the channel closing, which ends the stream the same way.
        let bus = EventBus::with_default_capacity();
        let rx = bus.subscribe();
        bus.publish(StreamResponse::Task(task));
        bus.finished();

        Ok(rx)
    }
}
