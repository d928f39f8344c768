//! Flow executor — binds an A2A request to a persisted run and drives the
//! flow.
//!
//! The executor is the single place where flow-level outcomes become
//! protocol events and run-status mutations: it initializes or reloads the
//! shared state, publishes the initial `task` event, translates orchestrator
//! hooks into `status-update` / `artifact-update` events (checkpointing a
//! step after every node completion), and emits exactly one terminal event
//! per task. No error escapes [`FlowExecutor::execute`] once a run exists;
//! the bus is always finished so the transport can close its stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::error::{MeshError, MeshResult};
use crate::flow::{
    Flow, FlowHooks, NodeRunState, NodeStatusUpdate, Params, SharedState,
};
use crate::store::{FlowStore, STEP_A2A_ERROR, STEP_A2A_FINAL, STEP_A2A_INIT};
use crate::types::{
    AgentCard, Artifact, Message, Part, StreamResponse, Task, TaskArtifactUpdateEvent, TaskState,
    TaskStatus, TaskStatusUpdateEvent,
};
use crate::utils::{new_agent_parts_message, new_agent_text_message, normalize_artifact_value};

use super::event_bus::EventBus;
use super::task_store::{PersistedTaskStore, TaskStore};

/// Context for one inbound A2A request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique identifier for this task.
    pub task_id: String,

    /// Conversation context identifier — groups related tasks.
    pub context_id: String,

    /// The incoming user message that triggered this execution.
    pub message: Message,

    /// Optional metadata from the client request.
    pub metadata: Option<Value>,
}

impl RequestContext {
    /// Build a context from the identifiers and inbound message.
    pub fn new(
        task_id: impl Into<String>,
        context_id: impl Into<String>,
        message: Message,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            context_id: context_id.into(),
            message,
            metadata: None,
        }
    }
}

/// A registered skill: the flow plus a run lock serializing executions.
///
/// The hook slots on a flow are single-writer for the duration of a run,
/// so concurrent tasks against the same skill take turns.
struct SkillEntry {
    flow: Arc<Flow>,
    run_lock: tokio::sync::Mutex<()>,
}

/// The task manager: a registry of skill flows plus the persistence glue
/// that turns flow runs into A2A tasks.
pub struct FlowExecutor {
    skills: HashMap<String, Arc<SkillEntry>>,
    store: Arc<dyn FlowStore>,
    task_store: Arc<PersistedTaskStore>,
    agent_card: AgentCard,
    /// Cancellation flags for in-flight executions, keyed by task id.
    /// Process-local: cancellation does not survive restart.
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

/// Clears flow hooks and deregisters the cancellation flag on every exit
/// path of an execution.
struct RunGuard<'a> {
    flow: Arc<Flow>,
    executor: &'a FlowExecutor,
    task_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flow.clear_hooks();
        self.executor
            .cancel_flags
            .lock()
            .expect("cancel flags poisoned")
            .remove(&self.task_id);
    }
}

impl FlowExecutor {
    /// Create an executor over the given store, advertising `agent_card`.
    pub fn new(store: Arc<dyn FlowStore>, agent_card: AgentCard) -> Self {
        let task_store = Arc::new(PersistedTaskStore::new(Arc::clone(&store)));
        Self {
            skills: HashMap::new(),
            store,
            task_store,
            agent_card,
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Register a flow under a skill id.
    pub fn register_skill(&mut self, skill_id: impl Into<String>, flow: Flow) {
        self.skills.insert(
            skill_id.into(),
            Arc::new(SkillEntry {
                flow: Arc::new(flow),
                run_lock: tokio::sync::Mutex::new(()),
            }),
        );
    }

    /// The advertised agent card.
    pub fn agent_card(&self) -> &AgentCard {
        &self.agent_card
    }

    /// The persistence port backing this executor.
    pub fn store(&self) -> Arc<dyn FlowStore> {
        Arc::clone(&self.store)
    }

    /// The task store adapter backing this executor.
    pub fn task_store(&self) -> Arc<PersistedTaskStore> {
        Arc::clone(&self.task_store)
    }

    /// The flow registered for a skill id, if any.
    pub fn flow_for_skill(&self, skill_id: &str) -> Option<Arc<Flow>> {
        self.skills.get(skill_id).map(|entry| Arc::clone(&entry.flow))
    }

    /// Execute the flow selected by the request's skill and publish the
    /// resulting protocol events on `bus`.
    ///
    /// The only error this returns is `SkillNotFound`, raised before any
    /// run is created. Every later failure is converted into a terminal
    /// `failed` event; the bus is finished on every path.
    pub async fn execute(&self, ctx: RequestContext, bus: &EventBus) -> MeshResult<()> {
        let (skill_id, entry) = match self.resolve_skill(&ctx.message) {
            Ok(resolved) => resolved,
            Err(err) => {
                bus.finished();
                return Err(err);
            }
        };

        self.execute_resolved(&skill_id, entry, &ctx, bus).await;
        bus.finished();
        Ok(())
    }

    /// Check that the message resolves to a registered skill, without
    /// creating a run. Used by streaming entry points to surface
    /// `SkillNotFound` before a stream exists.
    pub fn validate_skill(&self, message: &Message) -> MeshResult<()> {
        self.resolve_skill(message).map(|_| ())
    }

    /// Resolve the skill id from message metadata, falling back to the
    /// agent card's first skill.
    fn resolve_skill(&self, message: &Message) -> MeshResult<(String, Arc<SkillEntry>)> {
        let skill_id = message
            .skill_id()
            .map(String::from)
            .or_else(|| self.agent_card.skills.first().map(|s| s.id.clone()))
            .ok_or_else(|| {
                MeshError::SkillNotFound("no skill selected and none advertised".to_string())
            })?;

        let entry = self
            .skills
            .get(&skill_id)
            .cloned()
            .ok_or_else(|| MeshError::SkillNotFound(skill_id.clone()))?;

        Ok((skill_id, entry))
    }

    async fn execute_resolved(
        &self,
        skill_id: &str,
        entry: Arc<SkillEntry>,
        ctx: &RequestContext,
        bus: &EventBus,
    ) {
        let flow = Arc::clone(&entry.flow);
        let (mut shared, run_id, is_new) = match self.initialize_or_load(skill_id, ctx).await {
            Ok(initialized) => initialized,
            Err(err) => {
                error!(task_id = %ctx.task_id, error = %err, "Failed to initialize run");
                self.publish_terminal_failed(ctx, &err, bus);
                return;
            }
        };

        // Initial task event: submitted for a fresh task, working on resume.
        let initial_state = if is_new {
            TaskState::Submitted
        } else {
            TaskState::Working
        };
        let initial_task = Task {
            id: ctx.task_id.clone(),
            context_id: ctx.context_id.clone(),
            kind: "task".to_string(),
            status: TaskStatus::now(initial_state),
            artifacts: None,
            history: Some(vec![ctx.message.clone()]),
            metadata: Some(json!({ "skillId": skill_id })),
        };
        bus.publish(StreamResponse::Task(initial_task.clone()));

        // The snapshot carries the full hydrated history, not just the
        // single-message view the initial event shows.
        let mut initial_snapshot = initial_task;
        initial_snapshot.history = Some(shared.history());
        if let Err(err) = self.task_store.save(initial_snapshot).await {
            warn!(task_id = %ctx.task_id, error = %err, "Failed to save initial snapshot");
        }

        // Cancellation flag for cooperative cancel between nodes.
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .expect("cancel flags poisoned")
            .insert(ctx.task_id.clone(), Arc::clone(&cancel_flag));

        // Artifacts accumulate across the run (seeded from a resumed state)
        // and are folded into each checkpoint and the terminal state.
        let artifacts_acc: Arc<Mutex<Vec<Artifact>>> = Arc::new(Mutex::new(shared.artifacts()));

        let next_step_index = {
            let last = self.store.get_last_step(run_id).await.ok().flatten();
            Arc::new(AtomicI64::new(
                last.map(|s| s.step_index + 1).unwrap_or(1),
            ))
        };

        // One run at a time per flow: the hook slots are single-writer for
        // the duration of a run.
        let _run_permit = entry.run_lock.lock().await;

        flow.set_hooks(FlowHooks {
            on_status_update: Some(self.make_status_hook(
                ctx,
                bus,
                run_id,
                flow.node_count(),
                Arc::clone(&next_step_index),
                Arc::clone(&artifacts_acc),
                Arc::clone(&cancel_flag),
            )),
            on_artifact: Some(self.make_artifact_hook(
                ctx,
                bus,
                Arc::clone(&artifacts_acc),
                Arc::clone(&cancel_flag),
            )),
            cancel_flag: Some(Arc::clone(&cancel_flag)),
        });
        let _guard = RunGuard {
            flow: Arc::clone(&flow),
            executor: self,
            task_id: ctx.task_id.clone(),
        };

        let result = flow.run_lifecycle(&mut shared, &Params::new()).await;

        // Fold the artifacts observed during the run into the live state.
        let all_artifacts = artifacts_acc.lock().expect("artifacts poisoned").clone();
        if !all_artifacts.is_empty() {
            if let Ok(value) = serde_json::to_value(&all_artifacts) {
                shared.insert(crate::flow::KEY_ARTIFACTS, value);
            }
        }

        match result {
            Ok(_action) => {
                if cancel_flag.load(Ordering::SeqCst) {
                    // Canceled after the last node: the cancel path already
                    // published the terminal event and snapshot.
                    debug!(task_id = %ctx.task_id, "Run finished after cancel was requested");
                    return;
                }
                self.finish_completed(skill_id, ctx, run_id, &mut shared, &all_artifacts, bus)
                    .await;
            }
            Err(MeshError::Canceled) => {
                // cancel_task already published the canonical terminal
                // canceled event and snapshot; nothing more to emit.
                debug!(task_id = %ctx.task_id, "Run canceled cooperatively");
            }
            Err(err) => {
                self.finish_failed(skill_id, ctx, run_id, &mut shared, &err, bus)
                    .await;
            }
        }
    }

    /// Success epilogue: final message, terminal event, `A2A_FINAL` step,
    /// run status, snapshot.
    async fn finish_completed(
        &self,
        skill_id: &str,
        ctx: &RequestContext,
        run_id: i64,
        shared: &mut SharedState,
        artifacts: &[Artifact],
        bus: &EventBus,
    ) {
        // Final agent message parts, by precedence.
        let parts = shared
            .final_response_parts()
            .or_else(|| {
                shared
                    .get_str("lastEcho")
                    .map(|text| vec![Part::text(text)])
            })
            .unwrap_or_else(|| vec![Part::text("Flow completed.")]);
        let final_message = new_agent_parts_message(
            parts,
            Some(ctx.context_id.clone()),
            Some(ctx.task_id.clone()),
        );

        // Append to history unless identical to the newest entry.
        let mut history = shared.history();
        let duplicate = history
            .last()
            .map(|m| m.same_content(&final_message))
            .unwrap_or(false);
        if !duplicate {
            history.push(final_message.clone());
            if let Err(err) = shared.set_history(&history) {
                warn!(task_id = %ctx.task_id, error = %err, "Failed to record final message");
            }
        }

        bus.publish(StreamResponse::Message(final_message));
        bus.publish(StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
            task_id: ctx.task_id.clone(),
            context_id: ctx.context_id.clone(),
            kind: "status-update".to_string(),
            status: TaskStatus::now(TaskState::Completed),
            r#final: true,
            metadata: None,
        }));

        if let Err(err) = self
            .append_terminal_step(run_id, STEP_A2A_FINAL, "completed", shared)
            .await
        {
            error!(task_id = %ctx.task_id, error = %err, "Failed to persist final step");
        }
        if let Err(err) = self.store.update_run_status(run_id, TaskState::Completed).await {
            error!(task_id = %ctx.task_id, error = %err, "Failed to update run status");
        }

        let snapshot = Task {
            id: ctx.task_id.clone(),
            context_id: ctx.context_id.clone(),
            kind: "task".to_string(),
            status: TaskStatus::now(TaskState::Completed),
            artifacts: (!artifacts.is_empty()).then(|| artifacts.to_vec()),
            history: Some(history),
            metadata: Some(json!({ "skillId": skill_id })),
        };
        if let Err(err) = self.task_store.save(snapshot).await {
            error!(task_id = %ctx.task_id, error = %err, "Failed to save final snapshot");
        }
    }

    /// Failure epilogue: run status, synthetic error message, terminal
    /// event, `A2A_ERROR` step, snapshot.
    async fn finish_failed(
        &self,
        skill_id: &str,
        ctx: &RequestContext,
        run_id: i64,
        shared: &mut SharedState,
        err: &MeshError,
        bus: &EventBus,
    ) {
        error!(task_id = %ctx.task_id, run_id, error = %err, "Flow run failed");

        if let Err(status_err) = self.store.update_run_status(run_id, TaskState::Failed).await {
            error!(task_id = %ctx.task_id, error = %status_err, "Failed to update run status");
        }

        let error_message = new_agent_text_message(
            format!("PocketMesh flow failed: {}", err),
            Some(ctx.context_id.clone()),
            Some(ctx.task_id.clone()),
        );
        let mut history = shared.history();
        history.push(error_message.clone());
        if let Err(hist_err) = shared.set_history(&history) {
            warn!(task_id = %ctx.task_id, error = %hist_err, "Failed to record error message");
        }

        bus.publish(StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
            task_id: ctx.task_id.clone(),
            context_id: ctx.context_id.clone(),
            kind: "status-update".to_string(),
            status: TaskStatus {
                state: TaskState::Failed,
                message: Some(error_message),
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            },
            r#final: true,
            metadata: None,
        }));

        if let Err(step_err) = self
            .append_terminal_step(run_id, STEP_A2A_ERROR, "failed", shared)
            .await
        {
            error!(task_id = %ctx.task_id, error = %step_err, "Failed to persist error step");
        }

        let snapshot = Task {
            id: ctx.task_id.clone(),
            context_id: ctx.context_id.clone(),
            kind: "task".to_string(),
            status: TaskStatus::now(TaskState::Failed),
            artifacts: None,
            history: Some(history),
            metadata: Some(json!({ "skillId": skill_id })),
        };
        if let Err(snap_err) = self.task_store.save(snapshot).await {
            error!(task_id = %ctx.task_id, error = %snap_err, "Failed to save failed snapshot");
        }
    }

    /// Append a terminal checkpoint one index past the current last step.
    async fn append_terminal_step(
        &self,
        run_id: i64,
        node_name: &str,
        action: &str,
        shared: &SharedState,
    ) -> MeshResult<()> {
        let last = self.store.get_last_step(run_id).await?;
        let step_index = last.map(|s| s.step_index + 1).unwrap_or(0);
        self.store
            .add_step(run_id, node_name, Some(action), step_index, shared)
            .await?;
        Ok(())
    }

    /// Terminal `failed` event for errors before any run exists.
    fn publish_terminal_failed(&self, ctx: &RequestContext, err: &MeshError, bus: &EventBus) {
        let error_message = new_agent_text_message(
            format!("PocketMesh flow failed: {}", err),
            Some(ctx.context_id.clone()),
            Some(ctx.task_id.clone()),
        );
        bus.publish(StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
            task_id: ctx.task_id.clone(),
            context_id: ctx.context_id.clone(),
            kind: "status-update".to_string(),
            status: TaskStatus {
                state: TaskState::Failed,
                message: Some(error_message),
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            },
            r#final: true,
            metadata: None,
        }));
    }

    /// New task: create the run, bind the task, seed shared state, persist
    /// step 0. Existing task: hydrate from the last step, appending the
    /// incoming message to history at most once.
    async fn initialize_or_load(
        &self,
        skill_id: &str,
        ctx: &RequestContext,
    ) -> MeshResult<(SharedState, i64, bool)> {
        match self.store.run_id_for_task(&ctx.task_id).await? {
            None => {
                let run_id = self.store.create_run(skill_id).await?;
                self.store.map_task_to_run(&ctx.task_id, run_id).await?;

                let mut shared = SharedState::new();
                shared.set_history(std::slice::from_ref(&ctx.message))?;
                shared.set_incoming_message(&ctx.message)?;
                shared.set_a2a_context(&ctx.task_id, &ctx.context_id, skill_id);

                self.store
                    .add_step(run_id, STEP_A2A_INIT, None, 0, &shared)
                    .await?;

                debug!(task_id = %ctx.task_id, run_id, "New run initialized");
                Ok((shared, run_id, true))
            }
            Some(run_id) => {
                let last = self.store.get_last_step(run_id).await?.ok_or_else(|| {
                    MeshError::Persistence(format!("run {} has no persisted steps", run_id))
                })?;
                let mut shared = SharedState::from_json_str(&last.shared_state_json)?;

                let mut history = shared.history();
                let duplicate = history
                    .last()
                    .map(|m| m.same_content(&ctx.message))
                    .unwrap_or(false);
                if !duplicate {
                    history.push(ctx.message.clone());
                }
                shared.set_history(&history)?;
                shared.set_incoming_message(&ctx.message)?;
                shared.set_a2a_context(&ctx.task_id, &ctx.context_id, skill_id);

                debug!(task_id = %ctx.task_id, run_id, duplicate, "Run state reloaded");
                Ok((shared, run_id, false))
            }
        }
    }

    /// Status hook: every node transition becomes a non-final `working`
    /// status-update (node-level completed/failed included — only the
    /// executor decides terminal A2A states), and node completions are
    /// checkpointed. The synthetic `Flow` update is internal and not
    /// published; once cancellation is requested the terminal `canceled`
    /// event has been emitted, so later node updates checkpoint without
    /// publishing.
    #[allow(clippy::too_many_arguments)]
    fn make_status_hook(
        &self,
        ctx: &RequestContext,
        bus: &EventBus,
        run_id: i64,
        total_steps: usize,
        next_step_index: Arc<AtomicI64>,
        artifacts_acc: Arc<Mutex<Vec<Artifact>>>,
        cancel_flag: Arc<AtomicBool>,
    ) -> crate::flow::StatusHook {
        let bus = bus.clone();
        let store = Arc::clone(&self.store);
        let task_id = ctx.task_id.clone();
        let context_id = ctx.context_id.clone();

        Arc::new(move |update: NodeStatusUpdate| {
            let bus = bus.clone();
            let store = Arc::clone(&store);
            let task_id = task_id.clone();
            let context_id = context_id.clone();
            let next_step_index = Arc::clone(&next_step_index);
            let artifacts_acc = Arc::clone(&artifacts_acc);
            let cancel_flag = Arc::clone(&cancel_flag);

            Box::pin(async move {
                if update.node == "Flow" {
                    return;
                }

                if !cancel_flag.load(Ordering::SeqCst) {
                    let status_message = new_agent_text_message(
                        update.message.clone(),
                        Some(context_id.clone()),
                        Some(task_id.clone()),
                    );
                    bus.publish(StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
                        task_id: task_id.clone(),
                        context_id: context_id.clone(),
                        kind: "status-update".to_string(),
                        status: TaskStatus {
                            state: TaskState::Working,
                            message: Some(status_message),
                            timestamp: Some(chrono::Utc::now().to_rfc3339()),
                        },
                        r#final: false,
                        metadata: Some(json!({
                            "node": update.node,
                            "step": update.step,
                            "totalSteps": total_steps,
                        })),
                    }));
                }

                if update.state == NodeRunState::Completed {
                    let mut snapshot = update.shared.clone();
                    let artifacts = artifacts_acc.lock().expect("artifacts poisoned").clone();
                    if !artifacts.is_empty() {
                        if let Ok(value) = serde_json::to_value(&artifacts) {
                            snapshot.insert(crate::flow::KEY_ARTIFACTS, value);
                        }
                    }
                    let step_index = next_step_index.fetch_add(1, Ordering::SeqCst);
                    if let Err(err) = store
                        .add_step(
                            run_id,
                            &update.node,
                            update.action.as_deref(),
                            step_index,
                            &snapshot,
                        )
                        .await
                    {
                        warn!(
                            task_id = %task_id,
                            node = %update.node,
                            step_index,
                            error = %err,
                            "Failed to checkpoint node completion"
                        );
                    }
                }
            })
        })
    }

    /// Artifact hook: normalize (legacy `type` tags rewritten to `kind`,
    /// artifact id backfilled), publish, and accumulate for checkpoints.
    /// After cancellation artifacts are still accumulated for durability
    /// but no longer streamed.
    fn make_artifact_hook(
        &self,
        ctx: &RequestContext,
        bus: &EventBus,
        artifacts_acc: Arc<Mutex<Vec<Artifact>>>,
        cancel_flag: Arc<AtomicBool>,
    ) -> crate::flow::ArtifactHook {
        let bus = bus.clone();
        let task_id = ctx.task_id.clone();
        let context_id = ctx.context_id.clone();

        Arc::new(move |raw: Value| {
            let artifact = normalize_artifact_value(&raw);
            artifacts_acc
                .lock()
                .expect("artifacts poisoned")
                .push(artifact.clone());
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            bus.publish(StreamResponse::ArtifactUpdate(TaskArtifactUpdateEvent {
                task_id: task_id.clone(),
                context_id: context_id.clone(),
                kind: "artifact-update".to_string(),
                artifact,
                append: None,
                last_chunk: None,
                metadata: None,
            }));
        })
    }

    /// Cooperative cancel: no-op for unknown tasks, quiet return for
    /// terminal ones, otherwise flag the in-flight run (the orchestrator
    /// aborts between nodes), mark the run canceled, snapshot, and publish
    /// the single terminal `canceled` event. Idempotent.
    pub async fn cancel_task(&self, task_id: &str, bus: &EventBus) -> MeshResult<()> {
        let Some(task) = self.task_store.get(task_id).await? else {
            debug!(task_id = %task_id, "Cancel for unknown task — no-op");
            return Ok(());
        };

        if task.status.state.is_terminal() {
            debug!(task_id = %task_id, state = %task.status.state, "Cancel for terminal task");
            return Ok(());
        }

        if let Some(flag) = self
            .cancel_flags
            .lock()
            .expect("cancel flags poisoned")
            .get(task_id)
        {
            flag.store(true, Ordering::SeqCst);
        }

        if let Some(run_id) = self.store.run_id_for_task(task_id).await? {
            self.store
                .update_run_status(run_id, TaskState::Canceled)
                .await?;
        }

        let mut canceled = task;
        canceled.status = TaskStatus::now(TaskState::Canceled);
        let context_id = canceled.context_id.clone();
        self.task_store.save(canceled).await?;

        bus.publish(StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
            task_id: task_id.to_string(),
            context_id,
            kind: "status-update".to_string(),
            status: TaskStatus::now(TaskState::Canceled),
            r#final: true,
            metadata: None,
        }));

        Ok(())
    }
}
