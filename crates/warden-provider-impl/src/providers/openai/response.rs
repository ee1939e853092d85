use serde_json::Value as JsonValue;
use warden_protocol::openai::ChatCompletionResponse;
use warden_provider_core::{ProviderError, ProviderResult, Refusal, ResponseAdapter, ToolCall, Usage};

#[derive(Debug, Clone)]
pub struct OpenAiResponseAdapter {
    body: JsonValue,
    parsed: ChatCompletionResponse,
}

impl OpenAiResponseAdapter {
    pub fn new(body: JsonValue) -> ProviderResult<Self> {
        let parsed = serde_json::from_value(body.clone()).map_err(ProviderError::invalid_response)?;
        Ok(Self { body, parsed })
    }
}

impl ResponseAdapter for OpenAiResponseAdapter {
    fn tool_calls(&self) -> Vec<ToolCall> {
        self.parsed
            .choices
            .iter()
            .flat_map(|choice| choice.message.tool_calls.iter().flatten())
            .enumerate()
            .map(|(index, call)| ToolCall {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
                index: index as u32,
            })
            .collect()
    }

    fn usage(&self) -> Usage {
        let usage = self.parsed.usage.clone().unwrap_or_default();
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            ..Default::default()
        }
    }

    fn model(&self) -> Option<&str> {
        Some(self.parsed.model.as_str()).filter(|model| !model.is_empty())
    }

    fn text(&self) -> String {
        self.parsed
            .choices
            .iter()
            .filter_map(|choice| choice.message.content.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    fn stop_reason(&self) -> Option<&str> {
        self.parsed
            .choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
    }

    fn apply_refusal(&mut self, refusal: &Refusal) {
        let message = serde_json::json!({
            "role": "assistant",
            "content": refusal.user_message,
        });
        if let Some(obj) = self.body.as_object_mut() {
            obj.insert(
                "choices".to_string(),
                serde_json::json!([{
                    "index": 0,
                    "message": message,
                    "finish_reason": "stop",
                }]),
            );
        }
        if let Ok(parsed) = serde_json::from_value(self.body.clone()) {
            self.parsed = parsed;
        }
    }

    fn to_provider_response(&self) -> JsonValue {
        self.body.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool_response() -> JsonValue {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "delete_repo", "arguments": "{\"name\":\"core\"}"}}
                ]},
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 50, "completion_tokens": 9, "total_tokens": 59}
        })
    }

    #[test]
    fn reads_calls_usage_and_model() {
        let adapter = OpenAiResponseAdapter::new(tool_response()).unwrap();
        assert_eq!(adapter.tool_calls()[0].name, "delete_repo");
        assert_eq!(adapter.usage().input_tokens, 50);
        assert_eq!(adapter.usage().output_tokens, 9);
        assert_eq!(adapter.model(), Some("gpt-4o-2024-08-06"));
        assert_eq!(adapter.stop_reason(), Some("tool_calls"));
    }

    #[test]
    fn refusal_replaces_choices() {
        let mut adapter = OpenAiResponseAdapter::new(tool_response()).unwrap();
        adapter.apply_refusal(&Refusal {
            refusal_message: "delete_repo blocked".into(),
            user_message: "Not allowed.".into(),
        });
        assert!(adapter.tool_calls().is_empty());
        assert_eq!(adapter.text(), "Not allowed.");
        let body = adapter.to_provider_response();
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(!body.to_string().contains("delete_repo"));
        assert_eq!(body["usage"]["total_tokens"], 59);
    }
}
