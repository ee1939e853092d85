use std::collections::HashMap;

use serde_json::Value as JsonValue;
use warden_provider_core::{
    CommonMessage, MessageRole, RequestAdapter, ToolCall, ToolDefinition, ToolResult,
    ToolResultUpdate,
};

use crate::providers::update_for;

static NO_MESSAGES: JsonValue = JsonValue::Null;

/// `POST /chat/completions` body. `body` is the working copy; `original` never changes.
#[derive(Debug, Clone)]
pub struct OpenAiRequestAdapter {
    original: JsonValue,
    body: JsonValue,
}

impl OpenAiRequestAdapter {
    pub fn new(body: JsonValue) -> Self {
        Self {
            original: body.clone(),
            body,
        }
    }
}

fn content_text(content: &JsonValue) -> String {
    match content {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn str_field(value: &JsonValue, key: &str) -> String {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

impl RequestAdapter for OpenAiRequestAdapter {
    fn model(&self) -> &str {
        self.body
            .get("model")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
    }

    fn set_model(&mut self, model: &str) {
        if let Some(obj) = self.body.as_object_mut() {
            obj.insert("model".to_string(), JsonValue::String(model.to_string()));
        }
    }

    fn is_streaming(&self) -> bool {
        self.body
            .get("stream")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        self.body
            .get("tools")
            .and_then(JsonValue::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| {
                        let function = tool.get("function")?;
                        Some(ToolDefinition {
                            name: function.get("name")?.as_str()?.to_string(),
                            description: function
                                .get("description")
                                .and_then(JsonValue::as_str)
                                .map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn messages(&self) -> Vec<CommonMessage> {
        let mut tool_names: HashMap<String, String> = HashMap::new();
        let mut out = Vec::new();
        for message in self
            .body
            .get("messages")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
        {
            let content = message.get("content").unwrap_or(&JsonValue::Null);
            let role = match message.get("role").and_then(JsonValue::as_str) {
                Some("system") | Some("developer") => MessageRole::System,
                Some("assistant") => MessageRole::Assistant,
                Some("tool") => MessageRole::Tool,
                _ => MessageRole::User,
            };
            let mut common = CommonMessage::text(role, content_text(content));

            match role {
                MessageRole::Assistant => {
                    for (index, call) in message
                        .get("tool_calls")
                        .and_then(JsonValue::as_array)
                        .into_iter()
                        .flatten()
                        .enumerate()
                    {
                        let function = call.get("function").unwrap_or(&JsonValue::Null);
                        let id = str_field(call, "id");
                        let name = str_field(function, "name");
                        tool_names.insert(id.clone(), name.clone());
                        common.tool_calls.push(ToolCall {
                            id,
                            name,
                            arguments: str_field(function, "arguments"),
                            index: index as u32,
                        });
                    }
                }
                MessageRole::Tool => {
                    let id = str_field(message, "tool_call_id");
                    common.tool_results.push(ToolResult {
                        tool_name: tool_names.get(&id).cloned(),
                        tool_call_id: id,
                        content: content.clone(),
                        is_error: false,
                    });
                    common.text.clear();
                }
                _ => {}
            }
            out.push(common);
        }
        out
    }

    fn provider_messages(&self) -> &JsonValue {
        self.body.get("messages").unwrap_or(&NO_MESSAGES)
    }

    fn apply_tool_result_updates(&mut self, updates: &[ToolResultUpdate]) {
        if updates.is_empty() {
            return;
        }
        let Some(messages) = self
            .body
            .get_mut("messages")
            .and_then(JsonValue::as_array_mut)
        else {
            return;
        };
        for message in messages {
            if message.get("role").and_then(JsonValue::as_str) != Some("tool") {
                continue;
            }
            let Some(id) = message.get("tool_call_id").and_then(JsonValue::as_str) else {
                continue;
            };
            if let Some(update) = update_for(updates, id)
                && let Some(obj) = message.as_object_mut()
            {
                obj.insert(
                    "content".to_string(),
                    JsonValue::String(update.content.clone()),
                );
            }
        }
    }

    fn original_request(&self) -> &JsonValue {
        &self.original
    }

    /// Streaming requests ask for a trailing usage chunk unless the caller chose otherwise.
    fn to_provider_request(&self) -> JsonValue {
        let mut body = self.body.clone();
        if self.is_streaming()
            && let Some(obj) = body.as_object_mut()
        {
            let options = obj
                .entry("stream_options")
                .or_insert_with(|| JsonValue::Object(Default::default()));
            if let Some(options) = options.as_object_mut() {
                options
                    .entry("include_usage")
                    .or_insert(JsonValue::Bool(true));
            }
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> JsonValue {
        json!({
            "model": "gpt-4o",
            "stream": true,
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {}}}],
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "weather?"}]},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "{\"temp\": 3}"}
            ]
        })
    }

    #[test]
    fn normalizes_tool_turns() {
        let adapter = OpenAiRequestAdapter::new(sample());
        let messages = adapter.messages();
        assert_eq!(messages[1].text, "weather?");
        assert_eq!(messages[2].tool_calls[0].parsed_arguments()["city"], "Oslo");
        let result = &messages[3].tool_results[0];
        assert_eq!(result.tool_name.as_deref(), Some("get_weather"));
        assert_eq!(result.content_text(), "{\"temp\": 3}");
        assert!(adapter.has_tools());
    }

    #[test]
    fn streaming_requests_ask_for_usage() {
        let adapter = OpenAiRequestAdapter::new(sample());
        let body = adapter.to_provider_request();
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(adapter.original_request().get("stream_options").is_none());

        let mut caller_choice = sample();
        caller_choice["stream_options"] = json!({"include_usage": false});
        let adapter = OpenAiRequestAdapter::new(caller_choice);
        assert_eq!(
            adapter.to_provider_request()["stream_options"]["include_usage"],
            false
        );
    }

    #[test]
    fn replaces_tool_message_content() {
        let mut adapter = OpenAiRequestAdapter::new(sample());
        adapter.apply_compression(&[ToolResultUpdate {
            tool_call_id: "call_1".into(),
            content: "temp: 3".into(),
        }]);
        assert_eq!(adapter.provider_messages()[3]["content"], "temp: 3");
        assert_eq!(adapter.provider_messages()[0]["content"], "be brief");
    }
}
