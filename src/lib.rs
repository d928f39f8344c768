//! # pocketmesh — agentic workflow engine with an A2A task server
//!
//! PocketMesh runs developer-defined "skills" — each a directed graph of
//! nodes (a [`flow::Flow`]) — on behalf of remote A2A clients. Every
//! execution is a durable *run*: the engine checkpoints the shared state
//! after each node, streams status and artifact events over SSE, and
//! answers get/cancel/resubscribe against the persisted state.
//!
//! ## The two halves
//!
//! - **Flow engine** ([`flow`]): nodes implement
//!   `prepare → execute → finalize` ([`flow::Node`]); the orchestrator
//!   walks the graph, retries `execute` per node options (with optional
//!   fallback), fans batch items out sequentially or in parallel, and
//!   reports progress through observer hooks.
//! - **Task server** ([`server`]): the [`server::FlowExecutor`] binds each
//!   A2A task to a run, hydrates the shared state across requests,
//!   translates hooks into protocol events on the [`server::EventBus`],
//!   and handles cooperative cancellation. The axum layer (feature
//!   `server`, default on) exposes JSON-RPC 2.0 + SSE and the agent card.
//!
//! ## Durability model
//!
//! Runs and steps live in the [`store`] (SQLite via `sqlx` by default,
//! `POCKETMESH_DB_PATH` env, or in-memory for tests). Step 0 of every run
//! is the `A2A_INIT` checkpoint; each node completion appends a step; a
//! terminal `A2A_FINAL` (or `A2A_ERROR`) step closes the run. Task ids map
//! one-to-one onto runs, and the latest serialized Task is kept as a
//! snapshot so `tasks/get` never replays the flow.
//!
//! ## Defining a skill
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde_json::Value;
//! use pocketmesh::error::MeshResult;
//! use pocketmesh::flow::{Action, Flow, Node, Params, SharedState};
//!
//! struct EchoNode;
//!
//! #[async_trait]
//! impl Node for EchoNode {
//!     fn name(&self) -> &str {
//!         "EchoNode"
//!     }
//!
//!     async fn finalize(
//!         &self,
//!         shared: &mut SharedState,
//!         _prep: &Value,
//!         _exec: &Value,
//!         _params: &Params,
//!     ) -> MeshResult<Action> {
//!         let text = shared
//!             .incoming_message()
//!             .map(|m| pocketmesh::utils::get_message_text(&m, "\n"))
//!             .unwrap_or_default();
//!         shared.insert("lastEcho", Value::String(format!("Echo: {}", text)));
//!         Ok(None)
//!     }
//! }
//!
//! let mut flow = Flow::new("echo");
//! flow.add_node(EchoNode);
//! ```
//!
//! Registered under a skill id on a [`server::FlowExecutor`], that flow is
//! reachable via `message/send`, `message/stream`, `tasks/get`,
//! `tasks/cancel`, and `tasks/resubscribe`.
//!
//! ## Feature flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | yes     | axum JSON-RPC + SSE transport |
//! | `sqlite` | yes     | durable `SqliteFlowStore` via sqlx |

pub mod builders;
pub mod error;
pub mod flow;
pub mod server;
pub mod store;
pub mod types;
pub mod utils;

/// Prelude re-exporting the commonly used surface.
///
/// ```
/// use pocketmesh::prelude::*;
/// ```
pub mod prelude {
    pub use crate::builders::AgentCardBuilder;
    pub use crate::error::{MeshError, MeshResult};
    pub use crate::flow::{
        Action, Flow, FlowHooks, Node, NodeOptions, Params, SharedState, DEFAULT_ACTION,
    };
    pub use crate::server::{
        EventBus, FlowExecutor, MeshRequestHandler, PersistedTaskStore, RequestContext,
        RequestHandler, TaskStore,
    };
    pub use crate::store::{FlowStore, InMemoryFlowStore, Run, Step};
    pub use crate::types::{
        AgentCard, AgentSkill, Artifact, Message, Part, Role, SendMessageParams, StreamResponse,
        Task, TaskState, TaskStatus,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteFlowStore;

    #[cfg(feature = "server")]
    pub use crate::server::a2a_router;
}

pub use error::{MeshError, MeshResult};
pub use types::*;
