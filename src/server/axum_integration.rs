//! Axum integration — ready-made HTTP routes for the task server.
//!
//! Provides [`a2a_router`], an axum `Router` with:
//! - `POST /a2a` — JSON-RPC 2.0 dispatch for all A2A methods
//! - `GET /.well-known/agent-card.json` — agent card discovery
//! - `GET /.well-known/agent.json` — deprecated agent card path
//!
//! # Supported JSON-RPC methods
//!
//! | Method | Description |
//! |--------|-------------|
//! | `message/send` (`tasks/send`) | Send a message, get the final task |
//! | `message/stream` (`tasks/sendSubscribe`) | Send a message, stream events over SSE |
//! | `tasks/get` | Retrieve a task by ID |
//! | `tasks/cancel` | Cancel a running task |
//! | `tasks/resubscribe` | Replay a task's terminal state over SSE |

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};

use crate::error::{self, MeshError};
use crate::types::{
    AgentCard, GetTaskParams, JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse,
    SendMessageParams, StreamResponse, TaskIdParams,
};
use crate::utils::{AGENT_CARD_WELL_KNOWN_PATH, PREV_AGENT_CARD_WELL_KNOWN_PATH, RPC_PATH};

use super::request_handler::RequestHandler;

/// Shared state for the axum routes.
struct AppState {
    handler: Arc<dyn RequestHandler>,
    agent_card: AgentCard,
}

/// Create an axum Router with the A2A protocol routes.
pub fn a2a_router(handler: Arc<dyn RequestHandler>, agent_card: AgentCard) -> Router {
    let state = Arc::new(AppState {
        handler,
        agent_card,
    });

    Router::new()
        .route(AGENT_CARD_WELL_KNOWN_PATH, get(handle_agent_card))
        .route(
            PREV_AGENT_CARD_WELL_KNOWN_PATH,
            get(handle_agent_card_deprecated),
        )
        .route(RPC_PATH, post(handle_jsonrpc))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the agent card at the well-known endpoint.
async fn handle_agent_card(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(&state.agent_card).into_response()
}

/// Serve the agent card at the deprecated path (with a warning).
async fn handle_agent_card_deprecated(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    warn!(
        "Deprecated agent card endpoint '{}' accessed. Please use '{}' instead.",
        PREV_AGENT_CARD_WELL_KNOWN_PATH, AGENT_CARD_WELL_KNOWN_PATH
    );
    Json(&state.agent_card).into_response()
}

fn rpc_error(id: Option<JsonRpcId>, code: i64, message: impl Into<String>) -> Response {
    Json(JsonRpcResponse::error(
        id,
        JsonRpcError {
            code,
            message: message.into(),
            data: None,
        },
    ))
    .into_response()
}

fn rpc_mesh_error(id: Option<JsonRpcId>, err: MeshError) -> Response {
    Json(JsonRpcResponse::from_mesh_error(id, err)).into_response()
}

fn rpc_result<T: serde::Serialize>(id: Option<JsonRpcId>, result: &T) -> Response {
    match serde_json::to_value(result) {
        Ok(value) => Json(JsonRpcResponse::success(id, value)).into_response(),
        Err(err) => {
            error!(error = %err, "Failed to serialize response");
            rpc_error(
                id,
                error::INTERNAL_ERROR,
                format!("Internal error: {}", err),
            )
        }
    }
}

/// Main JSON-RPC dispatch handler.
async fn handle_jsonrpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    if request.jsonrpc != "2.0" {
        return rpc_error(
            request.id,
            error::INVALID_REQUEST,
            "Invalid JSON-RPC version — must be \"2.0\"",
        );
    }

    debug!(method = %request.method, "JSON-RPC request received");

    match request.method.as_str() {
        "message/send" | "tasks/send" => handle_message_send(state, request).await,
        "message/stream" | "tasks/sendSubscribe" => handle_message_stream(state, request).await,
        "tasks/get" => handle_tasks_get(state, request).await,
        "tasks/cancel" => handle_tasks_cancel(state, request).await,
        "tasks/resubscribe" => handle_tasks_resubscribe(state, request).await,
        method => {
            warn!(method = %method, "Unknown JSON-RPC method");
            rpc_error(
                request.id,
                error::METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
            )
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> Result<T, String> {
    let params = params.ok_or("missing params")?;
    serde_json::from_value(params).map_err(|e| e.to_string())
}

/// Handle `message/send` — synchronous execution returning the final task.
async fn handle_message_send(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: SendMessageParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => {
            return rpc_error(
                request.id,
                error::INVALID_PARAMS,
                format!("Invalid params: {}", e),
            );
        }
    };

    match state.handler.on_message_send(params).await {
        Ok(response) => rpc_result(request.id, &response),
        Err(err) => rpc_mesh_error(request.id, err),
    }
}

/// Handle `message/stream` — SSE streaming.
async fn handle_message_stream(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    // Streaming must be advertised by the agent card.
    if !state.agent_card.capabilities.streaming.unwrap_or(false) {
        return rpc_error(
            request.id,
            error::UNSUPPORTED_OPERATION,
            "Streaming is not supported by the agent",
        );
    }

    let params: SendMessageParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => {
            return rpc_error(
                request.id,
                error::INVALID_PARAMS,
                format!("Invalid params: {}", e),
            );
        }
    };

    match state.handler.on_message_send_stream(params).await {
        Ok(rx) => {
            let stream = make_sse_stream(request.id, rx);
            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Err(err) => rpc_mesh_error(request.id, err),
    }
}

/// Handle `tasks/get`.
async fn handle_tasks_get(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: GetTaskParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => {
            return rpc_error(
                request.id,
                error::INVALID_PARAMS,
                format!("Invalid params: {}", e),
            );
        }
    };

    match state.handler.on_get_task(params).await {
        Ok(task) => rpc_result(request.id, &task),
        Err(err) => rpc_mesh_error(request.id, err),
    }
}

/// Handle `tasks/cancel`.
async fn handle_tasks_cancel(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: TaskIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => {
            return rpc_error(
                request.id,
                error::INVALID_PARAMS,
                format!("Invalid params: {}", e),
            );
        }
    };

    match state.handler.on_cancel_task(params).await {
        Ok(task) => rpc_result(request.id, &task),
        Err(err) => rpc_mesh_error(request.id, err),
    }
}

/// Handle `tasks/resubscribe` — replay the terminal state over SSE.
async fn handle_tasks_resubscribe(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: TaskIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => {
            return rpc_error(
                request.id,
                error::INVALID_PARAMS,
                format!("Invalid params: {}", e),
            );
        }
    };

    match state.handler.on_resubscribe_to_task(params).await {
        Ok(rx) => {
            let stream = make_sse_stream(request.id, rx);
            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Err(err) => rpc_mesh_error(request.id, err),
    }
}

// ---- SSE streaming ----

/// Create an SSE stream from a broadcast receiver.
///
/// Each [`StreamResponse`] is wrapped in a JSON-RPC 2.0 success envelope
/// before being sent as an SSE event. The stream ends after the terminal
/// event (`final: true`) or when the channel closes.
fn make_sse_stream(
    request_id: Option<JsonRpcId>,
    mut rx: broadcast::Receiver<StreamResponse>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let is_terminal = event.is_final();

                    let event_type = match &event {
                        StreamResponse::StatusUpdate(_) => "statusUpdate",
                        StreamResponse::ArtifactUpdate(_) => "artifactUpdate",
                        StreamResponse::Task(_) => "task",
                        StreamResponse::Message(_) => "message",
                    };

                    match serde_json::to_value(&event) {
                        Ok(result_value) => {
                            let rpc_response =
                                JsonRpcResponse::success(request_id.clone(), result_value);
                            match serde_json::to_string(&rpc_response) {
                                Ok(json) => {
                                    yield Ok(Event::default().event(event_type).data(json));
                                }
                                Err(e) => {
                                    error!(error = %e, "Failed to serialize SSE JSON-RPC response");
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to serialize SSE event");
                        }
                    }

                    if is_terminal {
                        yield Ok(Event::default().event("done").data(""));
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    yield Ok(Event::default().event("done").data(""));
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "SSE stream lagged — some events were missed");
                }
            }
        }
    }
}
