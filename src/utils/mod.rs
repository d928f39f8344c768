//! Helper utilities for A2A messages, parts, and artifacts.

pub mod constants;
pub mod message;
pub mod parts;

pub use constants::*;
pub use message::{get_message_text, new_agent_parts_message, new_agent_text_message};
pub use parts::{
    get_data_parts, get_file_parts, get_text_parts, is_data_part, is_file_part, is_text_part,
    normalize_artifact_value,
};
