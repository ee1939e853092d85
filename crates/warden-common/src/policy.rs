//! Per-agent security policies and organization-wide optimization rules.

use serde::{Deserialize, Serialize};

use crate::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOperator {
    Equal,
    NotEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolInvocationAction {
    /// The call may proceed even when the context holds untrusted data.
    AllowWhenContextUntrusted,
    BlockAlways,
}

/// Matches a tool call whose argument at `argument_path` satisfies `operator value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocationPolicy {
    pub tool_name: String,
    /// Dot-separated path into the call arguments, e.g. `options.path`.
    pub argument_path: String,
    pub operator: PolicyOperator,
    pub value: String,
    pub action: ToolInvocationAction,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustedDataAction {
    MarkAsTrusted,
    BlockAlways,
    SanitizeWithDualLlm,
}

/// Matches a tool result whose attribute at `attribute_path` satisfies `operator value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedDataPolicy {
    pub tool_name: String,
    pub attribute_path: String,
    pub operator: PolicyOperator,
    pub value: String,
    pub action: TrustedDataAction,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultTreatment {
    Trusted,
    #[default]
    Untrusted,
    SanitizeWithDualLlm,
}

/// Per-tool defaults that apply when no policy matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tool_name: String,
    #[serde(default)]
    pub allow_usage_when_untrusted_data_is_present: bool,
    #[serde(default)]
    pub tool_result_treatment: ToolResultTreatment,
}

/// Everything the evaluators need for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub tool_invocation: Vec<ToolInvocationPolicy>,
    #[serde(default)]
    pub trusted_data: Vec<TrustedDataPolicy>,
    #[serde(default)]
    pub tool_configs: Vec<ToolConfig>,
}

impl PolicySet {
    pub fn tool_config(&self, tool_name: &str) -> Option<&ToolConfig> {
        self.tool_configs
            .iter()
            .find(|config| config.tool_name == tool_name)
    }

    pub fn is_empty(&self) -> bool {
        self.tool_invocation.is_empty()
            && self.trusted_data.is_empty()
            && self.tool_configs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizationCondition {
    /// Conversation text is at most this many tokens.
    MaxLength { max_tokens: u64 },
    HasTools { has_tools: bool },
}

/// Reroutes matching requests for `provider` to `target_model`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationRule {
    pub provider: ProviderKind,
    pub target_model: String,
    /// All conditions must hold; an empty list always matches.
    #[serde(default)]
    pub conditions: Vec<OptimizationCondition>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
}

fn enabled_default() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_set_roundtrips_from_stored_json() {
        let raw = r#"{
            "tool_invocation": [{"tool_name":"shell","argument_path":"cmd","operator":"starts_with","value":"rm","action":"block_always","reason":"destructive"}],
            "tool_configs": [{"tool_name":"read_file","tool_result_treatment":"sanitize_with_dual_llm"}]
        }"#;
        let set: PolicySet = serde_json::from_str(raw).unwrap();
        assert_eq!(set.tool_invocation[0].operator, PolicyOperator::StartsWith);
        assert!(set.trusted_data.is_empty());
        let config = set.tool_config("read_file").unwrap();
        assert_eq!(
            config.tool_result_treatment,
            ToolResultTreatment::SanitizeWithDualLlm
        );
        assert!(!config.allow_usage_when_untrusted_data_is_present);
    }

    #[test]
    fn optimization_rule_defaults_to_enabled() {
        let raw = r#"{"provider":"openai","target_model":"gpt-4o-mini","conditions":[{"type":"max_length","max_tokens":1000},{"type":"has_tools","has_tools":false}]}"#;
        let rule: OptimizationRule = serde_json::from_str(raw).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.priority, 0);
        assert_eq!(rule.conditions.len(), 2);
    }
}
