use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use warden_provider_core::CommonMessage;

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    CL100K
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                tracing::warn!(error = %err, "cl100k_base unavailable; estimating tokens from length");
                None
            }
        })
        .as_ref()
}

/// Approximate token counts with the `cl100k_base` vocabulary.
///
/// Counts are for routing and compression decisions only; billing always uses
/// the usage the upstream reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
    pub fn new() -> Self {
        Self
    }

    pub fn count_text(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        match encoder() {
            Some(bpe) => bpe.encode_ordinary(text).len() as u64,
            None => (text.chars().count() as u64).div_ceil(4),
        }
    }

    /// Message text, tool call arguments and tool result content.
    pub fn count_messages(&self, messages: &[CommonMessage]) -> u64 {
        messages
            .iter()
            .map(|message| {
                let mut total = self.count_text(&message.text);
                for call in &message.tool_calls {
                    total += self.count_text(&call.arguments);
                }
                for result in &message.tool_results {
                    total += self.count_text(&result.content_text());
                }
                total
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use warden_provider_core::MessageRole;

    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(TokenCounter::new().count_text(""), 0);
    }

    #[test]
    fn longer_text_counts_more() {
        let counter = TokenCounter::new();
        let short = counter.count_text("hello");
        let long = counter.count_text(&"hello world, how are you today? ".repeat(20));
        assert!(short >= 1);
        assert!(long > short);
    }

    #[test]
    fn messages_sum_their_parts() {
        let counter = TokenCounter::new();
        let one = CommonMessage::text(MessageRole::User, "What is the weather in Paris?");
        let single = counter.count_messages(std::slice::from_ref(&one));
        let double = counter.count_messages(&[one.clone(), one]);
        assert_eq!(double, single * 2);
    }
}
