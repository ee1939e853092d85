use serde_json::Value as JsonValue;
use warden_protocol::claude::{ContentBlock, MessageResponse};
use warden_provider_core::{ProviderError, ProviderResult, Refusal, ResponseAdapter, ToolCall, Usage};

#[derive(Debug, Clone)]
pub struct AnthropicResponseAdapter {
    body: JsonValue,
    parsed: MessageResponse,
}

impl AnthropicResponseAdapter {
    pub fn new(body: JsonValue) -> ProviderResult<Self> {
        let parsed = serde_json::from_value(body.clone()).map_err(ProviderError::invalid_response)?;
        Ok(Self { body, parsed })
    }
}

impl ResponseAdapter for AnthropicResponseAdapter {
    fn tool_calls(&self) -> Vec<ToolCall> {
        self.parsed
            .content
            .iter()
            .enumerate()
            .filter_map(|(index, block)| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.to_string(),
                    index: index as u32,
                }),
                _ => None,
            })
            .collect()
    }

    fn usage(&self) -> Usage {
        let usage = &self.parsed.usage;
        Usage {
            input_tokens: usage.input_tokens.unwrap_or_default(),
            output_tokens: usage.output_tokens.unwrap_or_default(),
            cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or_default(),
            cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or_default(),
        }
    }

    fn model(&self) -> Option<&str> {
        Some(self.parsed.model.as_str()).filter(|model| !model.is_empty())
    }

    fn text(&self) -> String {
        self.parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn stop_reason(&self) -> Option<&str> {
        self.parsed.stop_reason.as_deref()
    }

    fn apply_refusal(&mut self, refusal: &Refusal) {
        let text = ContentBlock::Text {
            text: refusal.user_message.clone(),
        };
        if let Some(obj) = self.body.as_object_mut() {
            obj.insert(
                "content".to_string(),
                serde_json::json!([{"type": "text", "text": refusal.user_message}]),
            );
            obj.insert("stop_reason".to_string(), JsonValue::from("end_turn"));
        }
        self.parsed.content = vec![text];
        self.parsed.stop_reason = Some("end_turn".to_string());
    }

    fn to_provider_response(&self) -> JsonValue {
        self.body.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool_use_response() -> JsonValue {
        json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "text", "text": "Reading."},
                {"type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {"path": "/etc/passwd"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 30}
        })
    }

    #[test]
    fn extracts_tool_calls_and_usage() {
        let adapter = AnthropicResponseAdapter::new(tool_use_response()).unwrap();
        let calls = adapter.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].parsed_arguments()["path"], "/etc/passwd");
        assert_eq!(adapter.usage().input_tokens, 12);
        assert_eq!(adapter.usage().output_tokens, 30);
        assert_eq!(adapter.model(), Some("claude-sonnet-4"));
    }

    #[test]
    fn refusal_drops_every_tool_block() {
        let mut adapter = AnthropicResponseAdapter::new(tool_use_response()).unwrap();
        adapter.apply_refusal(&Refusal {
            refusal_message: "blocked read_file".into(),
            user_message: "I can't do that.".into(),
        });
        assert!(adapter.tool_calls().is_empty());
        let body = adapter.to_provider_response();
        assert_eq!(body["content"], json!([{"type": "text", "text": "I can't do that."}]));
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["usage"]["input_tokens"], 12);
        assert!(!body.to_string().contains("tool_use"));
    }
}
