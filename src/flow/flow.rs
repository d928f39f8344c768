//! Flow — a rooted node graph and the orchestrator that drives it.
//!
//! The flow owns its nodes as an arena indexed by [`NodeId`]; edges are
//! action-keyed successor maps per node. This replaces the back-pointer a
//! garbage-collected implementation would hang on each node: the flow is
//! the ownership root, the orchestrator fires the observer hooks, and
//! cycles in the graph cost nothing because edges are plain indices.
//!
//! A flow is itself a [`Node`] — `prepare`/`finalize` wrap the
//! orchestration — but its `execute` is forbidden and fails with
//! `IllegalState`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{MeshError, MeshResult};
use crate::store::FlowStore;

use super::node::{merge_params, resolve_action, Action, Node, NodeOptions, Params, DEFAULT_ACTION};
use super::retry::retry;
use super::shared::{SharedState, KEY_RESULT_ARTIFACT};

/// Index of a node within its owning flow.
pub type NodeId = usize;

/// Observer for node-level progress. Awaited by the orchestrator, so the
/// executor can checkpoint the carried shared-state snapshot before the
/// next node starts.
pub type StatusHook =
    Arc<dyn Fn(NodeStatusUpdate) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observer for artifacts surfaced during a run. Receives the raw JSON
/// value a node produced (possibly legacy `type`-tagged); normalization
/// happens at the publish boundary. Synchronous because parallel batch
/// items fire it concurrently in completion order.
pub type ArtifactHook = Arc<dyn Fn(Value) + Send + Sync>;

/// Execution state of a single node within a run.
///
/// A node-level `Failed` is about the node, not the task — the A2A layer
/// maps every intermediate node state to `working` and only the executor
/// decides the terminal task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRunState {
    /// The node is being dispatched or is mid-lifecycle.
    Working,
    /// The node's lifecycle finished and produced an action.
    Completed,
    /// The node's lifecycle raised.
    Failed,
}

/// Progress notification handed to the status hook.
#[derive(Debug, Clone)]
pub struct NodeStatusUpdate {
    /// Name of the node (or `"Flow"` for the synthetic final update).
    pub node: String,

    /// Node-level execution state.
    pub state: NodeRunState,

    /// Human-readable progress message.
    pub message: String,

    /// Zero-based step counter within this run.
    pub step: usize,

    /// The resolved action, present on `Completed` updates.
    pub action: Option<String>,

    /// Snapshot of the shared state at emission time. `Completed` updates
    /// carry the post-finalize state the executor checkpoints.
    pub shared: SharedState,
}

/// Observer slots set by the executor before a run and cleared on
/// completion, plus the cooperative cancellation flag the orchestrator
/// polls between nodes.
#[derive(Clone, Default)]
pub struct FlowHooks {
    /// Node progress observer.
    pub on_status_update: Option<StatusHook>,

    /// Artifact observer.
    pub on_artifact: Option<ArtifactHook>,

    /// When set and flipped true, the orchestrator aborts between nodes
    /// with [`MeshError::Canceled`].
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl FlowHooks {
    async fn emit_status(&self, update: NodeStatusUpdate) {
        if let Some(hook) = &self.on_status_update {
            hook(update).await;
        }
    }

    fn emit_artifact(&self, raw: Value) {
        if let Some(hook) = &self.on_artifact {
            hook(raw);
        }
    }

    fn is_canceled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

struct NodeEntry {
    node: Arc<dyn Node>,
    successors: HashMap<String, NodeId>,
}

/// Outcome of a single [`Flow::step_once`] invocation.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Name of the node that ran, or `None` when the flow was already
    /// exhausted.
    pub node: Option<String>,

    /// The action the node's finalize returned (resolved).
    pub action: Option<String>,

    /// Step index the checkpoint was written at.
    pub step_index: Option<i64>,

    /// Whether the flow has no further node to run.
    pub done: bool,
}

/// A rooted, directed graph of nodes with a designated start node.
///
/// Construction is `&mut self`; a run borrows `&self`, so topology is
/// frozen for as long as any run is in flight.
pub struct Flow {
    name: String,
    nodes: Vec<NodeEntry>,
    start: Option<NodeId>,
    default_params: Params,
    hooks: Mutex<FlowHooks>,
}

impl Flow {
    /// Create an empty flow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            start: None,
            default_params: Params::new(),
            hooks: Mutex::new(FlowHooks::default()),
        }
    }

    /// Set flow-level default params (merged under node and runtime params).
    pub fn with_default_params(mut self, params: Params) -> Self {
        self.default_params = params;
        self
    }

    /// Add a node to the graph. The first node added becomes the start node
    /// unless [`set_start`](Flow::set_start) overrides it.
    pub fn add_node(&mut self, node: impl Node + 'static) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(NodeEntry {
            node: Arc::new(node),
            successors: HashMap::new(),
        });
        if self.start.is_none() {
            self.start = Some(id);
        }
        id
    }

    /// Designate the start node.
    pub fn set_start(&mut self, id: NodeId) {
        self.start = Some(id);
    }

    /// Wire `from --action--> to`. Rejects empty actions and duplicate
    /// actions on the same node.
    pub fn connect(&mut self, from: NodeId, action: &str, to: NodeId) -> MeshResult<()> {
        if action.is_empty() {
            return Err(MeshError::IllegalState(
                "successor action must be a non-empty string".to_string(),
            ));
        }
        if to >= self.nodes.len() || from >= self.nodes.len() {
            return Err(MeshError::IllegalState(format!(
                "unknown node id in edge {} -> {}",
                from, to
            )));
        }
        let entry = &mut self.nodes[from];
        if entry.successors.contains_key(action) {
            return Err(MeshError::IllegalState(format!(
                "duplicate successor action '{}' on node '{}'",
                action,
                entry.node.name()
            )));
        }
        entry.successors.insert(action.to_string(), to);
        Ok(())
    }

    /// Wire `from` to `to` under the default action.
    pub fn connect_to(&mut self, from: NodeId, to: NodeId) -> MeshResult<()> {
        self.connect(from, DEFAULT_ACTION, to)
    }

    /// Flow name (doubles as the skill's flow_name in run records).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Install observer hooks and the cancellation flag for a run.
    pub fn set_hooks(&self, hooks: FlowHooks) {
        *self.hooks.lock().expect("flow hooks poisoned") = hooks;
    }

    /// Clear all hooks (called in the executor's scope-exit guard).
    pub fn clear_hooks(&self) {
        *self.hooks.lock().expect("flow hooks poisoned") = FlowHooks::default();
    }

    /// Snapshot of the currently installed hooks.
    pub fn hooks(&self) -> FlowHooks {
        self.hooks.lock().expect("flow hooks poisoned").clone()
    }

    /// Entry point: flow-level prepare, orchestration, flow-level finalize.
    /// Returns the flow's resolved action (`"default"` when finalize
    /// returns nothing).
    pub async fn run_lifecycle(
        &self,
        shared: &mut SharedState,
        runtime_params: &Params,
    ) -> MeshResult<String> {
        let flow_prep = Node::prepare(self, shared, runtime_params).await?;
        self.orchestrate(shared, runtime_params).await?;
        let action =
            Node::finalize(self, shared, &flow_prep, &Value::Null, runtime_params).await?;
        Ok(resolve_action(action))
    }

    /// Walk the graph from the start node, driving each node's lifecycle
    /// and firing hooks, until a node with no matching successor ends the
    /// run.
    async fn orchestrate(
        &self,
        shared: &mut SharedState,
        runtime_params: &Params,
    ) -> MeshResult<()> {
        let hooks = self.hooks();
        let mut current = self.start.ok_or_else(|| {
            MeshError::IllegalState(format!("flow '{}' has no start node", self.name))
        })?;
        let mut step: usize = 0;

        loop {
            if hooks.is_canceled() {
                debug!(flow = %self.name, step, "Cancellation observed between nodes");
                return Err(MeshError::Canceled);
            }

            let entry = &self.nodes[current];
            let node_name = entry.node.name().to_string();

            hooks
                .emit_status(NodeStatusUpdate {
                    node: node_name.clone(),
                    state: NodeRunState::Working,
                    message: format!("Starting node {}", node_name),
                    step,
                    action: None,
                    shared: shared.clone(),
                })
                .await;

            let action = match self.run_node(current, shared, runtime_params, &hooks, step).await
            {
                Ok(action) => action,
                Err(MeshError::Canceled) => return Err(MeshError::Canceled),
                Err(err) => {
                    error!(flow = %self.name, node = %node_name, error = %err, "Node failed");
                    hooks
                        .emit_status(NodeStatusUpdate {
                            node: node_name.clone(),
                            state: NodeRunState::Failed,
                            message: err.to_string(),
                            step,
                            action: None,
                            shared: shared.clone(),
                        })
                        .await;
                    return Err(err);
                }
            };

            hooks
                .emit_status(NodeStatusUpdate {
                    node: node_name.clone(),
                    state: NodeRunState::Completed,
                    message: format!("Node {} completed", node_name),
                    step,
                    action: Some(action.clone()),
                    shared: shared.clone(),
                })
                .await;

            match entry.successors.get(&action) {
                Some(&next) => {
                    current = next;
                    step += 1;
                }
                None if entry.successors.is_empty() => break,
                None => {
                    let mut available: Vec<String> =
                        entry.successors.keys().cloned().collect();
                    available.sort();
                    let err = MeshError::IllegalTransition {
                        action,
                        node: node_name.clone(),
                        available,
                    };
                    hooks
                        .emit_status(NodeStatusUpdate {
                            node: node_name,
                            state: NodeRunState::Failed,
                            message: err.to_string(),
                            step,
                            action: None,
                            shared: shared.clone(),
                        })
                        .await;
                    return Err(err);
                }
            }
        }

        hooks
            .emit_status(NodeStatusUpdate {
                node: "Flow".to_string(),
                state: NodeRunState::Completed,
                message: "Flow completed".to_string(),
                step,
                action: None,
                shared: shared.clone(),
            })
            .await;
        Ok(())
    }

    /// Drive one node's full lifecycle (scalar or batch) and return its
    /// resolved action.
    async fn run_node(
        &self,
        id: NodeId,
        shared: &mut SharedState,
        runtime_params: &Params,
        hooks: &FlowHooks,
        step: usize,
    ) -> MeshResult<String> {
        let entry = &self.nodes[id];
        let node = &entry.node;
        let node_defaults = node.default_params();
        let params = merge_params(&[&self.default_params, &node_defaults, runtime_params]);

        let result = if node.is_batch() {
            self.run_batch_node(node, shared, &params, hooks, step).await
        } else {
            self.run_scalar_node(node, shared, &params, hooks).await
        };

        match result {
            Ok(action) => Ok(resolve_action(action)),
            Err(MeshError::Canceled) => Err(MeshError::Canceled),
            Err(err @ MeshError::NodeFailure { .. }) => Err(err),
            Err(err) => Err(MeshError::node_failure(node.name(), &err)),
        }
    }

    async fn run_scalar_node(
        &self,
        node: &Arc<dyn Node>,
        shared: &mut SharedState,
        params: &Params,
        hooks: &FlowHooks,
    ) -> MeshResult<Action> {
        let opts = node.options();
        let prep = node.prepare(shared, params).await?;

        let exec = {
            let shared_ro: &SharedState = shared;
            let label = format!("{}.execute", node.name());
            retry(
                &label,
                opts.max_retries,
                opts.wait_seconds,
                |attempt| node.execute(&prep, shared_ro, params, attempt),
                Some(Box::new(|err, attempt| {
                    node.execute_fallback(&prep, err, shared_ro, params, attempt)
                })),
            )
            .await?
        };

        if let Some(artifact) = exec.get(KEY_RESULT_ARTIFACT) {
            hooks.emit_artifact(artifact.clone());
        }

        node.finalize(shared, &prep, &exec, params).await
    }

    async fn run_batch_node(
        &self,
        node: &Arc<dyn Node>,
        shared: &mut SharedState,
        params: &Params,
        hooks: &FlowHooks,
        step: usize,
    ) -> MeshResult<Action> {
        let opts = node.options();
        let prep = node.prepare(shared, params).await?;

        let items: Vec<Value> = match &prep {
            Value::Array(items) => items.clone(),
            other => {
                return Err(MeshError::IllegalState(format!(
                    "batch node '{}' prepare must return a sequence, got {}",
                    node.name(),
                    json_type_name(other)
                )))
            }
        };
        let total = items.len();

        for idx in 0..total {
            hooks
                .emit_status(NodeStatusUpdate {
                    node: node.name().to_string(),
                    state: NodeRunState::Working,
                    message: format!("Processing batch item {}/{}", idx + 1, total),
                    step,
                    action: None,
                    shared: shared.clone(),
                })
                .await;
        }

        let results: Vec<Value> = {
            let shared_ro: &SharedState = shared;

            if opts.parallel {
                let item_futures: Vec<_> = items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| async move {
                        let result = run_item(node, item, shared_ro, params, &opts, idx).await?;
                        // Completion order for parallel items.
                        if let Some(artifact) = result.get(KEY_RESULT_ARTIFACT) {
                            hooks.emit_artifact(artifact.clone());
                        }
                        Ok::<Value, MeshError>(result)
                    })
                    .collect();
                // First error aborts the batch; pending items are dropped.
                futures::future::try_join_all(item_futures).await?
            } else {
                let mut results = Vec::with_capacity(total);
                for (idx, item) in items.iter().enumerate() {
                    let result = run_item(node, item, shared_ro, params, &opts, idx).await?;
                    if let Some(artifact) = result.get(KEY_RESULT_ARTIFACT) {
                        hooks.emit_artifact(artifact.clone());
                    }
                    results.push(result);
                }
                results
            }
        };

        let exec = Value::Array(results);
        node.finalize(shared, &prep, &exec, params).await
    }

    /// Run exactly one node of a persisted run and checkpoint the result.
    ///
    /// The next node is resolved by replaying the actions recorded in the
    /// run's steps from the start node; the shared state is hydrated from
    /// the latest step. Returns `done: true` without running anything when
    /// the recorded path has already reached a node with no successors.
    pub async fn step_once(
        &self,
        store: &dyn FlowStore,
        run_id: i64,
    ) -> MeshResult<StepOutcome> {
        let steps = store.get_steps_for_run(run_id).await?;
        let last = steps.last().ok_or_else(|| {
            MeshError::IllegalState(format!("run {} has no persisted steps", run_id))
        })?;
        let mut shared = SharedState::from_json_str(&last.shared_state_json)?;

        let mut current = self.start.ok_or_else(|| {
            MeshError::IllegalState(format!("flow '{}' has no start node", self.name))
        })?;

        // Replay recorded node steps to find the next node to run.
        for recorded in steps.iter().filter(|s| !s.node_name.starts_with("A2A_")) {
            let entry = &self.nodes[current];
            let action = recorded
                .action
                .clone()
                .unwrap_or_else(|| DEFAULT_ACTION.to_string());
            match entry.successors.get(&action) {
                Some(&next) => {
                    current = next;
                }
                None if entry.successors.is_empty() => {
                    return Ok(StepOutcome {
                        node: None,
                        action: None,
                        step_index: None,
                        done: true,
                    });
                }
                None => {
                    let mut available: Vec<String> =
                        entry.successors.keys().cloned().collect();
                    available.sort();
                    return Err(MeshError::IllegalTransition {
                        action,
                        node: entry.node.name().to_string(),
                        available,
                    });
                }
            }
        }

        let hooks = self.hooks();
        let node_name = self.nodes[current].node.name().to_string();
        let step_counter = steps
            .iter()
            .filter(|s| !s.node_name.starts_with("A2A_"))
            .count();
        let action = self
            .run_node(current, &mut shared, &self.default_params, &hooks, step_counter)
            .await?;

        let step_index = last.step_index + 1;
        store
            .add_step(run_id, &node_name, Some(&action), step_index, &shared)
            .await?;

        let done = self.nodes[current].successors.is_empty();

        Ok(StepOutcome {
            node: Some(node_name),
            action: Some(action),
            step_index: Some(step_index),
            done,
        })
    }
}

/// Per-item retry harness shared by the sequential and parallel batch paths.
async fn run_item(
    node: &Arc<dyn Node>,
    item: &Value,
    shared: &SharedState,
    params: &Params,
    opts: &NodeOptions,
    idx: usize,
) -> MeshResult<Value> {
    let label = format!("{}.execute_item[{}]", node.name(), idx);
    retry(
        &label,
        opts.max_retries,
        opts.wait_seconds,
        |attempt| node.execute_item(item, shared, params, attempt),
        Some(Box::new(move |err, attempt| {
            node.execute_item_fallback(item, err, shared, params, attempt)
        })),
    )
    .await
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl Node for Flow {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_params(&self) -> Params {
        self.default_params.clone()
    }

    async fn execute(
        &self,
        _prep: &Value,
        _shared: &SharedState,
        _params: &Params,
        _attempt: u32,
    ) -> MeshResult<Value> {
        Err(MeshError::IllegalState(
            "Flow cannot execute directly".to_string(),
        ))
    }
}
