use std::collections::HashMap;

use serde_json::Value as JsonValue;
use warden_provider_core::{
    CommonMessage, MessageRole, RequestAdapter, ToolCall, ToolDefinition, ToolResult,
    ToolResultUpdate,
};

use crate::providers::update_for;

static NO_MESSAGES: JsonValue = JsonValue::Null;

/// `POST /v1/messages` body. `body` is the working copy; `original` never changes.
#[derive(Debug, Clone)]
pub struct AnthropicRequestAdapter {
    original: JsonValue,
    body: JsonValue,
}

impl AnthropicRequestAdapter {
    pub fn new(body: JsonValue) -> Self {
        Self {
            original: body.clone(),
            body,
        }
    }

    fn raw_messages(&self) -> &[JsonValue] {
        self.body
            .get("messages")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn blocks_text(content: &JsonValue) -> String {
    match content {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(blocks) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(JsonValue::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

impl RequestAdapter for AnthropicRequestAdapter {
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
                        Some(ToolDefinition {
                            name: tool.get("name")?.as_str()?.to_string(),
                            description: tool
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
        let mut out = Vec::new();
        if let Some(system) = self.body.get("system") {
            let text = blocks_text(system);
            if !text.is_empty() {
                out.push(CommonMessage::text(MessageRole::System, text));
            }
        }

        let mut tool_names: HashMap<String, String> = HashMap::new();
        for message in self.raw_messages() {
            let role = match message.get("role").and_then(JsonValue::as_str) {
                Some("assistant") => MessageRole::Assistant,
                _ => MessageRole::User,
            };
            let content = message.get("content").unwrap_or(&JsonValue::Null);
            let mut common = CommonMessage::text(role, blocks_text(content));

            for (position, block) in content.as_array().into_iter().flatten().enumerate() {
                match block.get("type").and_then(JsonValue::as_str) {
                    Some("tool_use") => {
                        let id = block
                            .get("id")
                            .and_then(JsonValue::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let name = block
                            .get("name")
                            .and_then(JsonValue::as_str)
                            .unwrap_or_default()
                            .to_string();
                        tool_names.insert(id.clone(), name.clone());
                        common.tool_calls.push(ToolCall {
                            id,
                            name,
                            arguments: block
                                .get("input")
                                .map(JsonValue::to_string)
                                .unwrap_or_else(|| "{}".to_string()),
                            index: position as u32,
                        });
                    }
                    Some("tool_result") => {
                        let id = block
                            .get("tool_use_id")
                            .and_then(JsonValue::as_str)
                            .unwrap_or_default()
                            .to_string();
                        common.tool_results.push(ToolResult {
                            tool_name: tool_names.get(&id).cloned(),
                            tool_call_id: id,
                            content: block.get("content").cloned().unwrap_or(JsonValue::Null),
                            is_error: block
                                .get("is_error")
                                .and_then(JsonValue::as_bool)
                                .unwrap_or(false),
                        });
                    }
                    _ => {}
                }
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
            let Some(blocks) = message
                .get_mut("content")
                .and_then(JsonValue::as_array_mut)
            else {
                continue;
            };
            for block in blocks {
                if block.get("type").and_then(JsonValue::as_str) != Some("tool_result") {
                    continue;
                }
                let Some(id) = block.get("tool_use_id").and_then(JsonValue::as_str) else {
                    continue;
                };
                if let Some(update) = update_for(updates, id)
                    && let Some(obj) = block.as_object_mut()
                {
                    obj.insert(
                        "content".to_string(),
                        JsonValue::String(update.content.clone()),
                    );
                }
            }
        }
    }

    fn original_request(&self) -> &JsonValue {
        &self.original
    }

    fn to_provider_request(&self) -> JsonValue {
        self.body.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> JsonValue {
        json!({
            "model": "claude-sonnet-4",
            "max_tokens": 256,
            "system": [{"type": "text", "text": "be brief"}],
            "tools": [{"name": "read_file", "description": "reads", "input_schema": {}}],
            "messages": [
                {"role": "user", "content": "open it"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "sure"},
                    {"type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {"path": "/a"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "secret"}
                ]}
            ]
        })
    }

    #[test]
    fn normalizes_messages_and_resolves_tool_names() {
        let adapter = AnthropicRequestAdapter::new(sample());
        let messages = adapter.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[2].tool_calls[0].name, "read_file");
        let result = &messages[3].tool_results[0];
        assert_eq!(result.tool_name.as_deref(), Some("read_file"));
        assert_eq!(result.content_text(), "secret");
        assert_eq!(adapter.tools()[0].name, "read_file");
    }

    #[test]
    fn updates_touch_only_the_working_copy() {
        let mut adapter = AnthropicRequestAdapter::new(sample());
        adapter.set_model("claude-haiku");
        adapter.apply_tool_result_updates(&[ToolResultUpdate {
            tool_call_id: "toolu_1".into(),
            content: "[redacted]".into(),
        }]);
        let out = adapter.to_provider_request();
        assert_eq!(out["model"], "claude-haiku");
        assert_eq!(out["messages"][2]["content"][0]["content"], "[redacted]");
        assert_eq!(adapter.original_request()["model"], "claude-sonnet-4");
        assert_eq!(
            adapter.original_request()["messages"][2]["content"][0]["content"],
            "secret"
        );
        assert_eq!(out["tools"], adapter.original_request()["tools"]);
    }
}
