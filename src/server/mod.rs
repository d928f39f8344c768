//! A2A task server — executor, event bus, task store, and JSON-RPC glue.
//!
//! - [`FlowExecutor`] — binds requests to persisted runs and drives flows
//! - [`RequestContext`] — task/context ids + the inbound message
//! - [`EventBus`] — broadcast channel carrying protocol events
//! - [`TaskStore`] trait + [`PersistedTaskStore`] — snapshot persistence
//! - [`RequestHandler`] trait + [`MeshRequestHandler`] — JSON-RPC methods
//! - `a2a_router` — ready-made axum routes (feature `server`)
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pocketmesh::builders::AgentCardBuilder;
//! use pocketmesh::server::*;
//! use pocketmesh::store::SqliteFlowStore;
//!
//! let store = Arc::new(SqliteFlowStore::connect_default().await?);
//! let card = AgentCardBuilder::new("Echo Agent", "Echoes messages", "1.0.0")
//!     .url("http://localhost:7420/a2a")
//!     .skill("echo", "Echo", "Echoes the inbound text", vec![])
//!     .streaming(true)
//!     .build();
//!
//! let mut executor = FlowExecutor::new(store, card.clone());
//! executor.register_skill("echo", echo_flow());
//!
//! let handler = Arc::new(MeshRequestHandler::new(Arc::new(executor)));
//! let app = a2a_router(handler, card);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:7420").await?;
//! axum::serve(listener, app).await?;
//! ```

pub mod event_bus;
pub mod executor;
pub mod request_handler;
pub mod task_store;

#[cfg(feature = "server")]
pub mod axum_integration;

pub use event_bus::EventBus;
pub use executor::{FlowExecutor, RequestContext};
pub use request_handler::{MeshRequestHandler, RequestHandler};
pub use task_store::{PersistedTaskStore, TaskStore};

#[cfg(feature = "server")]
pub use axum_integration::a2a_router;
