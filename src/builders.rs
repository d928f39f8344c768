//! Builder for ergonomic construction of the agent card.

use crate::types::{AgentCapabilities, AgentCard, AgentProvider, AgentSkill};

/// Builder for [`AgentCard`] with sensible defaults: protocol version
/// `0.3.0`, preferred transport `JSONRPC`, text input/output modes.
///
/// # Example
///
/// ```
/// use pocketmesh::builders::AgentCardBuilder;
///
/// let card = AgentCardBuilder::new("Echo Agent", "Echoes messages back", "1.0.0")
///     .url("http://localhost:7420/a2a")
///     .skill("echo", "Echo", "Echoes the inbound text", vec!["demo".to_string()])
///     .streaming(true)
///     .build();
/// assert_eq!(card.protocol_version.as_deref(), Some("0.3.0"));
/// ```
#[derive(Debug, Clone)]
pub struct AgentCardBuilder {
    name: String,
    description: String,
    version: String,
    url: String,
    capabilities: AgentCapabilities,
    default_input_modes: Vec<String>,
    default_output_modes: Vec<String>,
    skills: Vec<AgentSkill>,
    provider: Option<AgentProvider>,
    documentation_url: Option<String>,
    icon_url: Option<String>,
}

impl AgentCardBuilder {
    /// Create a new builder with the required fields.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: version.into(),
            url: String::new(),
            capabilities: AgentCapabilities::default(),
            default_input_modes: vec!["text".to_string()],
            default_output_modes: vec!["text".to_string()],
            skills: Vec::new(),
            provider: None,
            documentation_url: None,
            icon_url: None,
        }
    }

    /// Set the agent's primary URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Enable or disable streaming support.
    pub fn streaming(mut self, enabled: bool) -> Self {
        self.capabilities.streaming = Some(enabled);
        self
    }

    /// Add a skill to the card.
    pub fn skill(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        self.skills.push(AgentSkill {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            tags,
            examples: None,
            input_modes: None,
            output_modes: None,
        });
        self
    }

    /// Add a fully specified skill.
    pub fn skill_full(mut self, skill: AgentSkill) -> Self {
        self.skills.push(skill);
        self
    }

    /// Set the provider information.
    pub fn provider(mut self, organization: impl Into<String>, url: impl Into<String>) -> Self {
        self.provider = Some(AgentProvider {
            organization: organization.into(),
            url: url.into(),
        });
        self
    }

    /// Set the documentation URL.
    pub fn documentation_url(mut self, url: impl Into<String>) -> Self {
        self.documentation_url = Some(url.into());
        self
    }

    /// Set the icon URL.
    pub fn icon_url(mut self, url: impl Into<String>) -> Self {
        self.icon_url = Some(url.into());
        self
    }

    /// Override the default input modes.
    pub fn input_modes(mut self, modes: Vec<String>) -> Self {
        self.default_input_modes = modes;
        self
    }

    /// Override the default output modes.
    pub fn output_modes(mut self, modes: Vec<String>) -> Self {
        self.default_output_modes = modes;
        self
    }

    /// Build the agent card.
    pub fn build(self) -> AgentCard {
        AgentCard {
            name: self.name,
            description: self.description,
            version: self.version,
            url: self.url,
            capabilities: self.capabilities,
            default_input_modes: self.default_input_modes,
            default_output_modes: self.default_output_modes,
            skills: self.skills,
            preferred_transport: Some("JSONRPC".to_string()),
            protocol_version: Some("0.3.0".to_string()),
            documentation_url: self.documentation_url,
            icon_url: self.icon_url,
            provider: self.provider,
            additional_interfaces: None,
            security: None,
            security_schemes: None,
            signatures: None,
            supports_authenticated_extended_card: None,
        }
    }
}
