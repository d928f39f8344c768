//! Error types — JSON-RPC error codes + engine-level errors.
//!
//! One unified enum covers both layers:
//! - Standard JSON-RPC 2.0 errors (-32700 through -32603) and the
//!   A2A task-server errors (-32001, -32002, -32004) surfaced on the wire.
//! - Flow-engine errors (illegal transitions, node failures, cancellation,
//!   persistence) that the executor converts into terminal task states.

use crate::types::JsonRpcError;

// ---------------------------------------------------------------------------
// Standard JSON-RPC 2.0 error codes
// ---------------------------------------------------------------------------

/// Invalid JSON was received by the server.
pub const PARSE_ERROR: i64 = -32700;

/// The JSON sent is not a valid Request object.
pub const INVALID_REQUEST: i64 = -32600;

/// The method does not exist / is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Invalid method parameter(s).
pub const INVALID_PARAMS: i64 = -32602;

/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

// ---------------------------------------------------------------------------
// A2A-specific error codes
// ---------------------------------------------------------------------------

/// The requested task was not found.
pub const TASK_NOT_FOUND: i64 = -32001;

/// The task cannot be canceled in its current state.
pub const TASK_NOT_CANCELABLE: i64 = -32002;

/// The requested operation is not supported.
pub const UNSUPPORTED_OPERATION: i64 = -32004;

// ---------------------------------------------------------------------------
// MeshError enum
// ---------------------------------------------------------------------------

/// Unified error type for the flow engine and the A2A task server.
///
/// Protocol variants carry a human-readable message and an optional
/// structured `data` payload and map onto JSON-RPC error codes via
/// [`code`](MeshError::code). Engine variants describe failures inside a
/// flow run; the executor is the single place that converts them into
/// terminal protocol events, so they only reach the wire as -32603 when
/// something escapes that boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MeshError {
    // -- Protocol errors (map to JSON-RPC error codes) --
    /// Invalid JSON payload (code -32700).
    #[error("Parse error: {message}")]
    ParseError {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Request payload validation error (code -32600).
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data (e.g. validation errors).
        data: Option<serde_json::Value>,
    },

    /// Method not found (code -32601).
    #[error("Method not found: {message}")]
    MethodNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Invalid parameters (code -32602).
    #[error("Invalid params: {message}")]
    InvalidParams {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Internal error (code -32603).
    #[error("Internal error: {message}")]
    InternalError {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Task not found (code -32001).
    #[error("Task not found: {message}")]
    TaskNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Task cannot be canceled (code -32002).
    #[error("Task not cancelable: {message}")]
    TaskNotCancelable {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Operation not supported (code -32004).
    #[error("Unsupported operation: {message}")]
    UnsupportedOperation {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    // -- Engine errors --
    /// Message metadata selected a skill that is not registered.
    ///
    /// Surfaced as invalid params (-32602); no run is created.
    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    /// An operation was invoked in a state that forbids it
    /// (e.g. calling `execute` on a flow).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A node's finalize action does not match any wired successor.
    #[error("Action '{action}' not found in successors of {node}. Available: {available:?}")]
    IllegalTransition {
        /// The action the node's finalize returned.
        action: String,
        /// Name of the node whose successors were searched.
        node: String,
        /// The action keys that are actually wired.
        available: Vec<String>,
    },

    /// A node's prepare, execute (after retries, no fallback), or finalize
    /// failed. Fatal to the flow run.
    #[error("Node '{node}' failed: {message}")]
    NodeFailure {
        /// Name of the failing node.
        node: String,
        /// Error text from the node.
        message: String,
    },

    /// Cooperative cancellation observed between nodes. A control-flow
    /// signal, not a fault — the executor converts it into a single
    /// terminal `canceled` event.
    #[error("Flow run canceled")]
    Canceled,

    /// Durable storage I/O failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Catch-all for errors raised inside node implementations.
    #[error("{0}")]
    Other(String),
}

/// Convenience result type used throughout the crate.
pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    // -- Convenience constructors (message-only, no data) --

    /// Create an `InvalidRequest` with a message and no data.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `MethodNotFound` with a message and no data.
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::MethodNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidParams` with a message and no data.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InternalError` with a message and no data.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `TaskNotFound` with a message and no data.
    pub fn task_not_found(message: impl Into<String>) -> Self {
        Self::TaskNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `TaskNotCancelable` with a message and no data.
    pub fn task_not_cancelable(message: impl Into<String>) -> Self {
        Self::TaskNotCancelable {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `UnsupportedOperation` with a message and no data.
    pub fn unsupported_operation(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
            data: None,
        }
    }

    /// Wrap an arbitrary node error with the failing node's name.
    pub fn node_failure(node: impl Into<String>, err: &MeshError) -> Self {
        Self::NodeFailure {
            node: node.into(),
            message: err.to_string(),
        }
    }

    /// Returns the JSON-RPC error code for this error variant.
    ///
    /// Engine errors that do not correspond to an A2A code map to
    /// -32603 (internal error).
    pub fn code(&self) -> i64 {
        match self {
            MeshError::ParseError { .. } => PARSE_ERROR,
            MeshError::InvalidRequest { .. } => INVALID_REQUEST,
            MeshError::MethodNotFound { .. } => METHOD_NOT_FOUND,
            MeshError::InvalidParams { .. } | MeshError::SkillNotFound(_) => INVALID_PARAMS,
            MeshError::InternalError { .. } => INTERNAL_ERROR,
            MeshError::TaskNotFound { .. } => TASK_NOT_FOUND,
            MeshError::TaskNotCancelable { .. } => TASK_NOT_CANCELABLE,
            MeshError::UnsupportedOperation { .. } => UNSUPPORTED_OPERATION,
            MeshError::IllegalState(_)
            | MeshError::IllegalTransition { .. }
            | MeshError::NodeFailure { .. }
            | MeshError::Canceled
            | MeshError::Persistence(_)
            | MeshError::Other(_) => INTERNAL_ERROR,
        }
    }
}

impl From<MeshError> for JsonRpcError {
    fn from(err: MeshError) -> Self {
        let code = err.code();
        let message = err.to_string();
        let data = match &err {
            MeshError::ParseError { data, .. }
            | MeshError::InvalidRequest { data, .. }
            | MeshError::MethodNotFound { data, .. }
            | MeshError::InvalidParams { data, .. }
            | MeshError::InternalError { data, .. }
            | MeshError::TaskNotFound { data, .. }
            | MeshError::TaskNotCancelable { data, .. }
            | MeshError::UnsupportedOperation { data, .. } => data.clone(),
            _ => None,
        };
        JsonRpcError {
            code,
            message,
            data,
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::ParseError {
            message: err.to_string(),
            data: None,
        }
    }
}
