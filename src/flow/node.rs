//! Node contract — the lifecycle surface every unit of work implements.
//!
//! A node moves through `prepare → execute → finalize`. `prepare` reads and
//! may mutate the shared state to produce the execute input; `execute` does
//! the actual work (retried per [`NodeOptions`]); `finalize` records results
//! back into the shared state and returns the action that keys the edge to
//! the next node.
//!
//! Batch nodes override [`execute_item`](Node::execute_item) and flag
//! themselves via [`is_batch`](Node::is_batch); the orchestrator then never
//! calls the scalar `execute`. Fallbacks default to re-raising, so a node
//! "has a fallback" exactly when it overrides one.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{MeshError, MeshResult};

use super::shared::SharedState;

/// Runtime parameters handed to node lifecycle methods. Merged as
/// flow defaults ⊕ node defaults ⊕ runtime params, later entries winning.
pub type Params = Map<String, Value>;

/// The action every edge map falls back to when a node's finalize returns
/// nothing.
pub const DEFAULT_ACTION: &str = "default";

/// The action string a node's finalize returns. `None` (or an empty string)
/// collapses to [`DEFAULT_ACTION`].
pub type Action = Option<String>;

/// Collapse a finalize result to the effective action string.
pub fn resolve_action(action: Action) -> String {
    match action {
        Some(a) if !a.is_empty() => a,
        _ => DEFAULT_ACTION.to_string(),
    }
}

/// Merge parameter maps, later maps winning on key conflicts.
pub fn merge_params(layers: &[&Params]) -> Params {
    let mut merged = Params::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Execution options for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeOptions {
    /// Total execute attempts (not retries-in-addition-to-one). Minimum 1.
    pub max_retries: u32,

    /// Wall-clock seconds to sleep between failed attempts.
    pub wait_seconds: f64,

    /// For batch nodes: process items concurrently instead of sequentially.
    pub parallel: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            max_retries: 1,
            wait_seconds: 0.0,
            parallel: false,
        }
    }
}

impl NodeOptions {
    /// Options with a retry budget and inter-attempt wait.
    pub fn with_retries(max_retries: u32, wait_seconds: f64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            wait_seconds,
            parallel: false,
        }
    }

    /// Options for a parallel batch node.
    pub fn parallel() -> Self {
        Self {
            parallel: true,
            ..Self::default()
        }
    }
}

/// A unit of computation in a flow graph.
///
/// All methods may perform I/O and are cancellable at their await points.
/// `prepare` and `finalize` are never retried; `execute` / `execute_item`
/// run under the retry harness configured by [`options`](Node::options).
/// The orchestrator guarantees single-writer access to the shared state
/// within a run, so implementations need no interior locking.
#[async_trait]
pub trait Node: Send + Sync {
    /// Node name, used in step records, status messages, and logs.
    fn name(&self) -> &str;

    /// Retry/parallelism options for this node.
    fn options(&self) -> NodeOptions {
        NodeOptions::default()
    }

    /// Default params, merged under runtime params at dispatch time.
    fn default_params(&self) -> Params {
        Params::new()
    }

    /// Marks this node as a batch node: `prepare` must yield a sequence and
    /// [`execute_item`](Node::execute_item) runs once per element. The
    /// scalar `execute` is never called for batch nodes.
    fn is_batch(&self) -> bool {
        false
    }

    /// Produce the input for `execute`. May mutate `shared`. Failure is
    /// immediate — no retry.
    async fn prepare(&self, shared: &mut SharedState, params: &Params) -> MeshResult<Value> {
        let _ = (shared, params);
        Ok(Value::Null)
    }

    /// The main work. Retried up to `options().max_retries` total attempts;
    /// `attempt` is 0-based so implementations can make idempotency
    /// decisions.
    async fn execute(
        &self,
        prep: &Value,
        shared: &SharedState,
        params: &Params,
        attempt: u32,
    ) -> MeshResult<Value> {
        let _ = (prep, shared, params, attempt);
        Ok(Value::Null)
    }

    /// Invoked instead of re-raising when `execute` has exhausted its
    /// retries; the result replaces the execute result. Default re-raises.
    async fn execute_fallback(
        &self,
        prep: &Value,
        error: MeshError,
        shared: &SharedState,
        params: &Params,
        attempt: u32,
    ) -> MeshResult<Value> {
        let _ = (prep, shared, params, attempt);
        Err(error)
    }

    /// Per-item work for batch nodes, under the same retry policy as
    /// `execute`. Only called when [`is_batch`](Node::is_batch) is true.
    async fn execute_item(
        &self,
        item: &Value,
        shared: &SharedState,
        params: &Params,
        attempt: u32,
    ) -> MeshResult<Value> {
        let _ = (item, shared, params, attempt);
        Err(MeshError::IllegalState(format!(
            "node '{}' is not a batch node",
            self.name()
        )))
    }

    /// Per-item fallback for batch nodes. Default re-raises.
    async fn execute_item_fallback(
        &self,
        item: &Value,
        error: MeshError,
        shared: &SharedState,
        params: &Params,
        attempt: u32,
    ) -> MeshResult<Value> {
        let _ = (item, shared, params, attempt);
        Err(error)
    }

    /// Record results into `shared` and return the action keying the next
    /// edge. For batch nodes `exec` is the array of per-item results.
    /// No retry.
    async fn finalize(
        &self,
        shared: &mut SharedState,
        prep: &Value,
        exec: &Value,
        params: &Params,
    ) -> MeshResult<Action> {
        let _ = (shared, prep, exec, params);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_action_collapses_missing_and_empty() {
        assert_eq!(resolve_action(None), "default");
        assert_eq!(resolve_action(Some(String::new())), "default");
        assert_eq!(resolve_action(Some("retry".to_string())), "retry");
    }

    #[test]
    fn merge_params_later_wins() {
        let mut flow_level = Params::new();
        flow_level.insert("a".to_string(), serde_json::json!(1));
        flow_level.insert("b".to_string(), serde_json::json!(1));

        let mut node_level = Params::new();
        node_level.insert("b".to_string(), serde_json::json!(2));

        let mut runtime = Params::new();
        runtime.insert("c".to_string(), serde_json::json!(3));

        let merged = merge_params(&[&flow_level, &node_level, &runtime]);
        assert_eq!(merged["a"], serde_json::json!(1));
        assert_eq!(merged["b"], serde_json::json!(2));
        assert_eq!(merged["c"], serde_json::json!(3));
    }

    #[test]
    fn default_options_are_single_attempt() {
        let opts = NodeOptions::default();
        assert_eq!(opts.max_retries, 1);
        assert_eq!(opts.wait_seconds, 0.0);
        assert!(!opts.parallel);
    }

    #[test]
    fn with_retries_enforces_minimum() {
        let opts = NodeOptions::with_retries(0, 0.5);
        assert_eq!(opts.max_retries, 1);
    }
}
