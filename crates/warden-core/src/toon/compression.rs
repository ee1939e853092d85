use serde_json::Value as JsonValue;
use warden_common::ProviderKind;
use warden_provider_core::{CommonMessage, ToolResultUpdate};
use warden_storage::PricingStore;

use super::encoder;
use crate::tokens::TokenCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotEnabled,
    NoToolResults,
    NotSmaller,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotEnabled => "not_enabled",
            SkipReason::NoToolResults => "no_tool_results",
            SkipReason::NotSmaller => "not_smaller",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressionStats {
    pub tokens_before: u64,
    pub tokens_after: u64,
    /// USD at the actual model's input price.
    pub cost_savings: Option<f64>,
    pub skip_reason: Option<SkipReason>,
}

impl CompressionStats {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn tokens_saved(&self) -> u64 {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}

/// Rewrites JSON tool results into TOON when that actually saves tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToonCompressor {
    counter: TokenCounter,
}

impl ToonCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only results whose whole content is one JSON object or array in text
    /// form are candidates; each is replaced only if its TOON form is
    /// strictly smaller.
    pub fn plan(
        &self,
        messages: &[CommonMessage],
        enabled: bool,
    ) -> (Vec<ToolResultUpdate>, CompressionStats) {
        if !enabled {
            return (Vec::new(), CompressionStats::skipped(SkipReason::NotEnabled));
        }
        let results: Vec<_> = messages
            .iter()
            .flat_map(|message| message.tool_results.iter())
            .collect();
        if results.is_empty() {
            return (Vec::new(), CompressionStats::skipped(SkipReason::NoToolResults));
        }

        let mut updates = Vec::new();
        let mut before = 0;
        let mut after = 0;
        for result in results {
            // Results with images or several blocks are left whole.
            let Some(text) = result.sole_text() else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<JsonValue>(text.trim()) else {
                continue;
            };
            if !matches!(parsed, JsonValue::Object(_) | JsonValue::Array(_)) {
                continue;
            }
            let encoded = encoder::encode(&parsed);
            let original_tokens = self.counter.count_text(text);
            let encoded_tokens = self.counter.count_text(&encoded);
            if encoded_tokens >= original_tokens {
                continue;
            }
            before += original_tokens;
            after += encoded_tokens;
            updates.push(ToolResultUpdate {
                tool_call_id: result.tool_call_id.clone(),
                content: encoded,
            });
        }

        if updates.is_empty() {
            return (Vec::new(), CompressionStats::skipped(SkipReason::NotSmaller));
        }
        let stats = CompressionStats {
            tokens_before: before,
            tokens_after: after,
            cost_savings: None,
            skip_reason: None,
        };
        (updates, stats)
    }

    /// `plan` plus savings priced at the actual model's input rate.
    pub async fn compress<P>(
        &self,
        messages: &[CommonMessage],
        enabled: bool,
        model: &str,
        provider: ProviderKind,
        pricing: &P,
    ) -> (Vec<ToolResultUpdate>, CompressionStats)
    where
        P: PricingStore + ?Sized,
    {
        let (updates, mut stats) = self.plan(messages, enabled);
        if stats.skip_reason.is_none() {
            match pricing.find_pricing(model, provider).await {
                Ok(Some(price)) => {
                    stats.cost_savings = Some(price.cost(stats.tokens_saved(), 0));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(model, error = %err, "pricing lookup for compression savings failed");
                }
            }
        }
        tracing::debug!(
            tokens_before = stats.tokens_before,
            tokens_after = stats.tokens_after,
            skip_reason = stats.skip_reason.map(|reason| reason.as_str()),
            "toon compression"
        );
        (updates, stats)
    }
}

#[cfg(test)]
mod tests {
    use warden_provider_core::{MessageRole, ToolResult};

    use super::*;

    fn with_result(id: &str, content: JsonValue) -> CommonMessage {
        let mut message = CommonMessage::text(MessageRole::Tool, "");
        message.tool_results.push(ToolResult {
            tool_call_id: id.to_string(),
            tool_name: Some("list_users".to_string()),
            content,
            is_error: false,
        });
        message
    }

    fn table_json(rows: usize) -> String {
        let rows: Vec<_> = (0..rows)
            .map(|n| serde_json::json!({"id": n, "name": format!("user{n}"), "active": n % 2 == 0}))
            .collect();
        serde_json::to_string_pretty(&serde_json::json!({"users": rows})).unwrap()
    }

    #[test]
    fn disabled_is_a_noop_with_reason() {
        let messages = vec![with_result("t1", JsonValue::String(table_json(20)))];
        let (updates, stats) = ToonCompressor::new().plan(&messages, false);
        assert!(updates.is_empty());
        assert_eq!(stats, CompressionStats::skipped(SkipReason::NotEnabled));
    }

    #[test]
    fn no_tool_results_is_reported() {
        let messages = vec![CommonMessage::text(MessageRole::User, "hi")];
        let (_, stats) = ToonCompressor::new().plan(&messages, true);
        assert_eq!(stats.skip_reason, Some(SkipReason::NoToolResults));
        assert_eq!(stats.tokens_before, 0);
    }

    #[test]
    fn plain_text_results_are_not_smaller() {
        let messages = vec![with_result("t1", JsonValue::String("just some text".into()))];
        let (updates, stats) = ToonCompressor::new().plan(&messages, true);
        assert!(updates.is_empty());
        assert_eq!(stats.skip_reason, Some(SkipReason::NotSmaller));
        assert_eq!(SkipReason::NotSmaller.as_str(), "not_smaller");
    }

    #[test]
    fn results_with_non_text_blocks_are_left_alone() {
        let content = serde_json::json!([
            {"type": "text", "text": table_json(30)},
            {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "iVBORw0KGgo="}}
        ]);
        let messages = vec![with_result("t1", content)];
        let (updates, stats) = ToonCompressor::new().plan(&messages, true);
        assert!(updates.is_empty());
        assert_eq!(stats.skip_reason, Some(SkipReason::NotSmaller));
    }

    #[test]
    fn single_text_block_is_compressed() {
        let content = serde_json::json!([{"type": "text", "text": table_json(30)}]);
        let messages = vec![with_result("t1", content)];
        let (updates, _) = ToonCompressor::new().plan(&messages, true);
        assert_eq!(updates.len(), 1);
        assert!(updates[0].content.starts_with("users[30]{id,name,active}:"));
    }

    #[test]
    fn tabular_json_shrinks() {
        let messages = vec![with_result("t1", JsonValue::String(table_json(30)))];
        let (updates, stats) = ToonCompressor::new().plan(&messages, true);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].tool_call_id, "t1");
        assert!(updates[0].content.starts_with("users[30]{id,name,active}:"));
        assert!(stats.tokens_after < stats.tokens_before);
        assert_eq!(stats.skip_reason, None);
    }
}
