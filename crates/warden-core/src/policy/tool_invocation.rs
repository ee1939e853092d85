use std::collections::HashSet;

use warden_common::{GlobalToolPolicy, PolicySet, ToolInvocationAction, ToolInvocationPolicy};
use warden_provider_core::{Refusal, ToolCall};

use super::matcher;

/// Decides whether the tool calls a model proposed may reach the caller.
pub struct ToolInvocationEvaluator<'a> {
    pub policies: &'a PolicySet,
    pub tool_policy: GlobalToolPolicy,
    pub context_trusted: bool,
    /// Tools the caller declared usable, plus every tool with a config.
    pub enabled_tools: &'a HashSet<String>,
}

impl ToolInvocationEvaluator<'_> {
    /// The first call that is not allowed refuses the whole response.
    pub fn evaluate(&self, calls: &[ToolCall]) -> Option<Refusal> {
        calls.iter().find_map(|call| {
            let reason = self.deny_reason(call)?;
            tracing::info!(tool = %call.name, reason = %reason, "tool invocation refused");
            Some(refusal(call, &reason))
        })
    }

    fn deny_reason(&self, call: &ToolCall) -> Option<String> {
        let arguments = call.parsed_arguments();
        let matching: Vec<&ToolInvocationPolicy> = self
            .policies
            .tool_invocation
            .iter()
            .filter(|policy| matcher::tool_name_matches(&policy.tool_name, &call.name))
            .filter(|policy| {
                matcher::matches(&arguments, &policy.argument_path, policy.operator, &policy.value)
            })
            .collect();

        if let Some(policy) = matching
            .iter()
            .find(|policy| policy.action == ToolInvocationAction::BlockAlways)
        {
            return Some(
                policy
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("{} is blocked by a tool invocation policy", call.name)),
            );
        }

        if self.tool_policy == GlobalToolPolicy::Permissive {
            return None;
        }

        if !self.enabled_tools.contains(&call.name) {
            return Some(format!("{} is not enabled for this agent", call.name));
        }

        if self.context_trusted {
            return None;
        }
        let allowed_by_config = self
            .policies
            .tool_config(&call.name)
            .is_some_and(|config| config.allow_usage_when_untrusted_data_is_present);
        let allowed_by_policy = matching
            .iter()
            .any(|policy| policy.action == ToolInvocationAction::AllowWhenContextUntrusted);
        if allowed_by_config || allowed_by_policy {
            return None;
        }
        Some(format!(
            "{} cannot be used while the context contains untrusted data",
            call.name
        ))
    }
}

fn refusal(call: &ToolCall, reason: &str) -> Refusal {
    let arguments = if call.arguments.trim().is_empty() {
        "{}"
    } else {
        call.arguments.as_str()
    };
    Refusal {
        refusal_message: format!(
            "I tried to invoke the {} tool with the following arguments: {arguments}.\n\nHowever, I was denied by a tool invocation policy:\n\n{reason}",
            call.name
        ),
        user_message: format!(
            "I wanted to use the {} tool, but it was blocked by a security policy: {reason}",
            call.name
        ),
    }
}
