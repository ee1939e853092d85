pub mod agent;
pub mod config;
pub mod policy;

pub use agent::{Agent, AgentType, IdentityProvider};
pub use config::{
    DualLlmConfig, GlobalConfig, GlobalConfigError, GlobalConfigPatch, ProviderBaseUrls,
};
pub use policy::{
    OptimizationCondition, OptimizationRule, PolicyOperator, PolicySet, ToolConfig,
    ToolInvocationAction, ToolInvocationPolicy, ToolResultTreatment, TrustedDataAction,
    TrustedDataPolicy,
};

use serde::{Deserialize, Serialize};

/// Upstream vendors the proxy knows how to speak to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    /// Local OpenAI-compatible inference backend; no API key required upstream.
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Organization-wide default for tools that no explicit policy covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalToolPolicy {
    /// Tool results are trusted and tool calls allowed unless a policy says otherwise.
    Permissive,
    /// Unknown tool results are untrusted and undeclared tools are refused.
    #[default]
    Restrictive,
}

impl GlobalToolPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "permissive" => Some(GlobalToolPolicy::Permissive),
            "restrictive" => Some(GlobalToolPolicy::Restrictive),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parse_is_case_insensitive() {
        assert_eq!(ProviderKind::parse("OpenAI"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::parse(" anthropic "), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::parse("gemini"), None);
    }

    #[test]
    fn provider_kind_serializes_lowercase() {
        let value = serde_json::to_value(ProviderKind::OpenAi).unwrap();
        assert_eq!(value, serde_json::json!("openai"));
    }

    #[test]
    fn tool_policy_defaults_to_restrictive() {
        assert_eq!(GlobalToolPolicy::default(), GlobalToolPolicy::Restrictive);
        assert_eq!(
            GlobalToolPolicy::parse("PERMISSIVE"),
            Some(GlobalToolPolicy::Permissive)
        );
    }
}
