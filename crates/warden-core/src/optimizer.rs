use warden_common::{OptimizationCondition, OptimizationRule, ProviderKind};
use warden_provider_core::CommonMessage;

use crate::tokens::TokenCounter;

/// Picks a cheaper model for requests that match an optimization rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostOptimizer {
    counter: TokenCounter,
}

impl CostOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enabled rules for `provider` are tried by ascending priority; the first
    /// whose conditions all hold wins. `None` when nothing matches or the
    /// winner names the model already requested.
    pub fn select_model(
        &self,
        rules: &[OptimizationRule],
        provider: ProviderKind,
        current_model: &str,
        messages: &[CommonMessage],
        has_tools: bool,
    ) -> Option<String> {
        let mut candidates: Vec<&OptimizationRule> = rules
            .iter()
            .filter(|rule| rule.enabled && rule.provider == provider)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|rule| rule.priority);

        let mut tokens = None;
        let winner = candidates.into_iter().find(|rule| {
            rule.conditions.iter().all(|condition| match condition {
                OptimizationCondition::MaxLength { max_tokens } => {
                    let count = *tokens.get_or_insert_with(|| self.counter.count_messages(messages));
                    count <= *max_tokens
                }
                OptimizationCondition::HasTools { has_tools: wanted } => *wanted == has_tools,
            })
        })?;

        if winner.target_model == current_model || winner.target_model.trim().is_empty() {
            return None;
        }
        tracing::debug!(
            from = current_model,
            to = %winner.target_model,
            priority = winner.priority,
            "optimization rule matched"
        );
        Some(winner.target_model.clone())
    }
}
