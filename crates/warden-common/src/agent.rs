use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    #[default]
    Agent,
    LlmProxy,
    McpGateway,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Agent => "agent",
            AgentType::LlmProxy => "llm_proxy",
            AgentType::McpGateway => "mcp_gateway",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent" => Some(AgentType::Agent),
            "llm_proxy" => Some(AgentType::LlmProxy),
            "mcp_gateway" => Some(AgentType::McpGateway),
            _ => None,
        }
    }
}

/// Logical caller the proxy attributes traffic to. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub agent_type: AgentType,
    /// Treat every prior message as untrusted regardless of tool policies.
    pub consider_context_untrusted: bool,
    pub identity_provider_id: Option<Uuid>,
    pub is_default: bool,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            agent_type: AgentType::default(),
            consider_context_untrusted: false,
            identity_provider_id: None,
            is_default: false,
        }
    }
}

/// External OIDC issuer whose tokens may authenticate callers of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProvider {
    pub id: Uuid,
    pub issuer: String,
    pub jwks_url: String,
    pub audience: Option<String>,
}
