//! Constants for well-known URIs used by the task server.

/// The well-known path for the agent card (v0.3+ of the A2A spec).
pub const AGENT_CARD_WELL_KNOWN_PATH: &str = "/.well-known/agent-card.json";

/// The previous well-known path for the agent card (deprecated, but still
/// served).
pub const PREV_AGENT_CARD_WELL_KNOWN_PATH: &str = "/.well-known/agent.json";

/// The JSON-RPC endpoint path.
pub const RPC_PATH: &str = "/a2a";
