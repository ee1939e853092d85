use serde_json::Value as JsonValue;
use warden_common::{
    Agent, GlobalToolPolicy, PolicySet, ToolResultTreatment, TrustedDataAction, TrustedDataPolicy,
};
use warden_provider_core::{CommonMessage, MessageRole, ToolResult, ToolResultUpdate};

use super::matcher;
use crate::dual_llm::{DualLlmSubagent, ProgressSink};

/// Result of the trusted-data pass over a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustVerdict {
    /// False once any tool result left in the context is untrusted.
    pub context_trusted: bool,
    /// Content replacements for blocked or sanitized results.
    pub updates: Vec<ToolResultUpdate>,
    pub blocked: Vec<String>,
    pub sanitized: Vec<String>,
}

impl TrustVerdict {
    pub fn trusted() -> Self {
        Self {
            context_trusted: true,
            updates: Vec::new(),
            blocked: Vec::new(),
            sanitized: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Trusted,
    Untrusted,
    Block,
    Sanitize,
}

pub struct TrustedDataEvaluator<'a> {
    pub agent: &'a Agent,
    pub policies: &'a PolicySet,
    pub tool_policy: GlobalToolPolicy,
    pub dual_llm: Option<&'a DualLlmSubagent>,
    pub progress: Option<&'a ProgressSink>,
}

impl TrustedDataEvaluator<'_> {
    pub async fn evaluate(&self, messages: &[CommonMessage]) -> TrustVerdict {
        let mut verdict = TrustVerdict::trusted();
        let user_request = last_user_text(messages);

        for result in messages.iter().flat_map(|message| message.tool_results.iter()) {
            let tool_name = result.tool_name.as_deref().unwrap_or_default();
            let text = result.content_text();
            match self.disposition(tool_name, result, &text) {
                Disposition::Trusted => {}
                Disposition::Untrusted => verdict.context_trusted = false,
                Disposition::Block => {
                    verdict.updates.push(ToolResultUpdate {
                        tool_call_id: result.tool_call_id.clone(),
                        content: format!(
                            "[tool result from {tool_name} blocked by trusted data policy]"
                        ),
                    });
                    verdict.blocked.push(result.tool_call_id.clone());
                }
                Disposition::Sanitize => {
                    let Some(dual_llm) = self.dual_llm else {
                        tracing::warn!(tool_name, "no dual llm configured; result stays untrusted");
                        verdict.context_trusted = false;
                        continue;
                    };
                    match dual_llm
                        .sanitize(user_request, tool_name, &text, self.progress)
                        .await
                    {
                        Ok(summary) => {
                            verdict.updates.push(ToolResultUpdate {
                                tool_call_id: result.tool_call_id.clone(),
                                content: summary,
                            });
                            verdict.sanitized.push(result.tool_call_id.clone());
                        }
                        Err(err) => {
                            tracing::warn!(tool_name, error = %err, "dual llm sanitization failed; result stays untrusted");
                            verdict.context_trusted = false;
                        }
                    }
                }
            }
        }

        if self.agent.consider_context_untrusted {
            verdict.context_trusted = false;
        }
        verdict
    }

    /// BlockAlways beats SanitizeWithDualLlm beats MarkAsTrusted; with no
    /// matching policy the tool config, then the global policy, decides.
    fn disposition(&self, tool_name: &str, result: &ToolResult, text: &str) -> Disposition {
        let content = structured_content(result, text);
        let matching: Vec<&TrustedDataPolicy> = self
            .policies
            .trusted_data
            .iter()
            .filter(|policy| matcher::tool_name_matches(&policy.tool_name, tool_name))
            .filter(|policy| {
                matcher::matches(&content, &policy.attribute_path, policy.operator, &policy.value)
            })
            .collect();
        let has = |action: TrustedDataAction| matching.iter().any(|policy| policy.action == action);

        if has(TrustedDataAction::BlockAlways) {
            return Disposition::Block;
        }
        if has(TrustedDataAction::SanitizeWithDualLlm) {
            return Disposition::Sanitize;
        }
        if has(TrustedDataAction::MarkAsTrusted) {
            return Disposition::Trusted;
        }

        let treatment = match self.policies.tool_config(tool_name) {
            Some(config) => config.tool_result_treatment,
            None => match self.tool_policy {
                GlobalToolPolicy::Permissive => ToolResultTreatment::Trusted,
                GlobalToolPolicy::Restrictive => ToolResultTreatment::Untrusted,
            },
        };
        match treatment {
            ToolResultTreatment::Trusted => Disposition::Trusted,
            ToolResultTreatment::Untrusted => Disposition::Untrusted,
            ToolResultTreatment::SanitizeWithDualLlm => Disposition::Sanitize,
        }
    }
}

/// Tool output that is JSON text is matched as JSON; anything else as a string.
fn structured_content(result: &ToolResult, text: &str) -> JsonValue {
    if let JsonValue::Object(_) = result.content {
        return result.content.clone();
    }
    serde_json::from_str::<JsonValue>(text.trim())
        .ok()
        .filter(|value| value.is_object() || value.is_array())
        .unwrap_or_else(|| JsonValue::String(text.to_string()))
}

fn last_user_text(messages: &[CommonMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::User && !message.text.trim().is_empty())
        .map(|message| message.text.as_str())
        .unwrap_or_default()
}
