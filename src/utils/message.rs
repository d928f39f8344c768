//! Utility functions for creating and reading A2A Message objects.

use uuid::Uuid;

use crate::types::{Message, Part, Role};
use crate::utils::parts::get_text_parts;

/// Creates a new agent message containing a single text part.
pub fn new_agent_text_message(
    text: impl Into<String>,
    context_id: Option<impl Into<String>>,
    task_id: Option<impl Into<String>>,
) -> Message {
    new_agent_parts_message(vec![Part::text(text)], context_id, task_id)
}

/// Creates a new agent message containing a list of parts.
pub fn new_agent_parts_message(
    parts: Vec<Part>,
    context_id: Option<impl Into<String>>,
    task_id: Option<impl Into<String>>,
) -> Message {
    Message {
        message_id: Uuid::new_v4().to_string(),
        role: Role::Agent,
        kind: "message".to_string(),
        parts,
        context_id: context_id.map(|id| id.into()),
        task_id: task_id.map(|id| id.into()),
        metadata: None,
    }
}

/// Extracts and joins all text content from a message's parts.
pub fn get_message_text(message: &Message, delimiter: &str) -> String {
    get_text_parts(&message.parts).join(delimiter)
}
