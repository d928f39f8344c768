//! Shared state — the per-run mutable mapping nodes read and write.
//!
//! The map is deliberately untyped (string → JSON value): the node contract
//! is cross-cutting and a typed record would leak every node's keys into
//! every other node's signature. The A2A context travels through a set of
//! reserved `__a2a_*` keys with typed accessors below.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MeshError, MeshResult};
use crate::types::{Artifact, Message, Part};

/// Reserved key: the current inbound message (populated per request).
pub const KEY_INCOMING_MESSAGE: &str = "__a2a_incoming_message";

/// Reserved key: ordered sequence of user and agent messages across the
/// task's lifetime.
pub const KEY_HISTORY: &str = "__a2a_history";

/// Reserved key: when present and a sequence, supplies the parts of the
/// terminal agent message.
pub const KEY_FINAL_RESPONSE_PARTS: &str = "__a2a_final_response_parts";

/// Reserved key: A2A context id for this task.
pub const KEY_CONTEXT_ID: &str = "__a2a_context_id";

/// Reserved key: task id bound to this shared state.
pub const KEY_TASK_ID: &str = "__a2a_task_id";

/// Reserved key: selected skill id.
pub const KEY_SKILL_ID: &str = "__a2a_skill_id";

/// Reserved key: artifacts accumulated so far (for `tasks/get`).
pub const KEY_ARTIFACTS: &str = "__a2a_artifacts";

/// Result-carried artifact marker: a node's execute result that is an
/// object containing this key signals an artifact emission.
pub const KEY_RESULT_ARTIFACT: &str = "__a2a_artifact";

/// The in-run mapping used for node-to-node data passing and A2A context.
///
/// Created empty on new-task, hydrated from the last persisted step on
/// resume, mutated in place by node `prepare`/`finalize`, and checkpointed
/// after each node's completion. Serializes transparently as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState(Map<String, Value>);

impl SharedState {
    /// Create an empty shared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrate from a persisted step's serialized blob.
    pub fn from_json_str(json: &str) -> MeshResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            MeshError::Persistence(format!("failed to deserialize shared state: {}", e))
        })
    }

    /// Serialize for checkpointing.
    pub fn to_json_string(&self) -> MeshResult<String> {
        serde_json::to_string(&self.0)
            .map_err(|e| MeshError::Persistence(format!("failed to serialize shared state: {}", e)))
    }

    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Raw value insertion, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Remove a key, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// String lookup (`None` for missing or non-string values).
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Number of entries (reserved keys included).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the state holds no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // -- Typed accessors for the reserved A2A keys --

    /// The current inbound message, if set.
    pub fn incoming_message(&self) -> Option<Message> {
        self.0
            .get(KEY_INCOMING_MESSAGE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Set the current inbound message.
    pub fn set_incoming_message(&mut self, message: &Message) -> MeshResult<()> {
        self.0
            .insert(KEY_INCOMING_MESSAGE.to_string(), serde_json::to_value(message)?);
        Ok(())
    }

    /// The message history, defaulting to empty for missing or malformed
    /// entries (resumed runs may predate the key).
    pub fn history(&self) -> Vec<Message> {
        self.0
            .get(KEY_HISTORY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Replace the message history.
    pub fn set_history(&mut self, history: &[Message]) -> MeshResult<()> {
        self.0
            .insert(KEY_HISTORY.to_string(), serde_json::to_value(history)?);
        Ok(())
    }

    /// Append one message to the history.
    pub fn push_history(&mut self, message: Message) -> MeshResult<()> {
        let mut history = self.history();
        history.push(message);
        self.set_history(&history)
    }

    /// The parts of the terminal agent message, when a node supplied them
    /// and the sequence is non-empty.
    pub fn final_response_parts(&self) -> Option<Vec<Part>> {
        let parts: Vec<Part> = self
            .0
            .get(KEY_FINAL_RESPONSE_PARTS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())?;
        if parts.is_empty() {
            None
        } else {
            Some(parts)
        }
    }

    /// Task id bound to this state.
    pub fn task_id(&self) -> Option<&str> {
        self.get_str(KEY_TASK_ID)
    }

    /// Context id bound to this state.
    pub fn context_id(&self) -> Option<&str> {
        self.get_str(KEY_CONTEXT_ID)
    }

    /// Selected skill id.
    pub fn skill_id(&self) -> Option<&str> {
        self.get_str(KEY_SKILL_ID)
    }

    /// Bind the A2A identifiers for this request.
    pub fn set_a2a_context(&mut self, task_id: &str, context_id: &str, skill_id: &str) {
        self.0
            .insert(KEY_TASK_ID.to_string(), Value::String(task_id.to_string()));
        self.0.insert(
            KEY_CONTEXT_ID.to_string(),
            Value::String(context_id.to_string()),
        );
        self.0
            .insert(KEY_SKILL_ID.to_string(), Value::String(skill_id.to_string()));
    }

    /// Artifacts accumulated so far.
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.0
            .get(KEY_ARTIFACTS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Append an artifact to the accumulated list.
    pub fn push_artifact(&mut self, artifact: &Artifact) -> MeshResult<()> {
        let mut artifacts = self.artifacts();
        artifacts.push(artifact.clone());
        self.0
            .insert(KEY_ARTIFACTS.to_string(), serde_json::to_value(artifacts)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut shared = SharedState::new();
        shared.insert("counter", serde_json::json!(3));
        shared.set_a2a_context("t1", "ctx1", "echo");

        let json = shared.to_json_string().unwrap();
        let back = SharedState::from_json_str(&json).unwrap();
        assert_eq!(back, shared);
        assert_eq!(back.task_id(), Some("t1"));
        assert_eq!(back.skill_id(), Some("echo"));
    }

    #[test]
    fn history_defaults_to_empty() {
        let shared = SharedState::new();
        assert!(shared.history().is_empty());
    }

    #[test]
    fn push_history_appends_in_order() {
        let mut shared = SharedState::new();
        shared.push_history(Message::user("m1", "one")).unwrap();
        shared.push_history(Message::agent("m2", "two")).unwrap();

        let history = shared.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message_id, "m1");
        assert_eq!(history[1].message_id, "m2");
    }

    #[test]
    fn empty_final_parts_are_ignored() {
        let mut shared = SharedState::new();
        shared.insert(KEY_FINAL_RESPONSE_PARTS, serde_json::json!([]));
        assert!(shared.final_response_parts().is_none());

        shared.insert(
            KEY_FINAL_RESPONSE_PARTS,
            serde_json::json!([{"kind": "text", "text": "done"}]),
        );
        let parts = shared.final_response_parts().unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn artifacts_accumulate() {
        let mut shared = SharedState::new();
        let artifact = Artifact {
            artifact_id: "a1".to_string(),
            name: None,
            description: None,
            parts: vec![Part::text("x")],
            metadata: None,
        };
        shared.push_artifact(&artifact).unwrap();
        shared.push_artifact(&artifact).unwrap();
        assert_eq!(shared.artifacts().len(), 2);
    }
}
