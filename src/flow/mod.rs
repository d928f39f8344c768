//! Flow engine — node contract, retry harness, and the graph orchestrator.
//!
//! A skill is a [`Flow`]: a rooted, directed graph of [`Node`]s. The
//! orchestrator drives each node through `prepare → execute → finalize`,
//! checkpoints nothing itself (that is the executor's job), and reports
//! progress through the [`FlowHooks`] observer slots.

pub mod flow;
pub mod node;
pub mod retry;
pub mod shared;

pub use flow::{
    ArtifactHook, Flow, FlowHooks, NodeId, NodeRunState, NodeStatusUpdate, StatusHook,
    StepOutcome,
};
pub use node::{merge_params, resolve_action, Action, Node, NodeOptions, Params, DEFAULT_ACTION};
pub use retry::{retry, Fallback};
pub use shared::{
    SharedState, KEY_ARTIFACTS, KEY_CONTEXT_ID, KEY_FINAL_RESPONSE_PARTS, KEY_HISTORY,
    KEY_INCOMING_MESSAGE, KEY_RESULT_ARTIFACT, KEY_SKILL_ID, KEY_TASK_ID,
};
