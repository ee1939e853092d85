//! Provider-agnostic view of a conversation.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A tool invocation proposed by the model. `arguments` is the raw JSON text
/// exactly as the provider produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// Stream discriminator: content block index (Anthropic) or tool call index (OpenAI).
    pub index: u32,
}

impl ToolCall {
    /// Parsed arguments; anything that is not a JSON object reads as `{}`.
    pub fn parsed_arguments(&self) -> JsonValue {
        let trimmed = self.arguments.trim();
        if trimmed.is_empty() {
            return JsonValue::Object(Default::default());
        }
        match serde_json::from_str::<JsonValue>(trimmed) {
            Ok(value @ JsonValue::Object(_)) => value,
            _ => JsonValue::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    /// Resolved from the assistant turn that issued the call, when present.
    pub tool_name: Option<String>,
    pub content: JsonValue,
    pub is_error: bool,
}

impl ToolResult {
    /// Text form of the content; JSON strings are unwrapped, text blocks concatenated.
    pub fn content_text(&self) -> String {
        content_to_text(&self.content)
    }

    /// The content when it is exactly one piece of text: a string or a lone
    /// text block. Results carrying images or several blocks return `None`.
    pub fn sole_text(&self) -> Option<&str> {
        match &self.content {
            JsonValue::String(text) => Some(text),
            JsonValue::Array(blocks) => match blocks.as_slice() {
                [JsonValue::String(text)] => Some(text),
                [JsonValue::Object(block)]
                    if block
                        .get("type")
                        .and_then(JsonValue::as_str)
                        .is_none_or(|kind| kind == "text") =>
                {
                    block.get("text").and_then(JsonValue::as_str)
                }
                _ => None,
            },
            _ => None,
        }
    }
}

pub(crate) fn content_to_text(content: &JsonValue) -> String {
    match content {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                JsonValue::String(text) => Some(text.clone()),
                JsonValue::Object(obj) => obj
                    .get("text")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl CommonMessage {
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

/// Replacement content for one tool result, keyed by the call id it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultUpdate {
    pub tool_call_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Text that replaces blocked tool calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refusal {
    /// Audit text naming the blocked tool, its arguments and the reason.
    pub refusal_message: String,
    /// What the caller sees.
    pub user_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_arguments_parse_as_empty_object() {
        let call = ToolCall {
            arguments: "{\"path\": \"/etc".to_string(),
            ..Default::default()
        };
        assert_eq!(call.parsed_arguments(), serde_json::json!({}));

        let call = ToolCall {
            arguments: "[1,2]".to_string(),
            ..Default::default()
        };
        assert_eq!(call.parsed_arguments(), serde_json::json!({}));
    }

    #[test]
    fn tool_result_text_joins_blocks() {
        let result = ToolResult {
            tool_call_id: "t1".into(),
            tool_name: None,
            content: serde_json::json!([{"type":"text","text":"a"},{"type":"text","text":"b"}]),
            is_error: false,
        };
        assert_eq!(result.content_text(), "a\nb");
        assert_eq!(result.sole_text(), None);
    }

    #[test]
    fn sole_text_rejects_mixed_blocks() {
        let mut result = ToolResult {
            tool_call_id: "t1".into(),
            tool_name: None,
            content: serde_json::json!("{\"a\":1}"),
            is_error: false,
        };
        assert_eq!(result.sole_text(), Some("{\"a\":1}"));

        result.content = serde_json::json!([{"type": "text", "text": "{\"a\":1}"}]);
        assert_eq!(result.sole_text(), Some("{\"a\":1}"));

        result.content = serde_json::json!([
            {"type": "text", "text": "{\"a\":1}"},
            {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "iVBO"}}
        ]);
        assert_eq!(result.sole_text(), None);

        result.content = serde_json::json!([
            {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "iVBO"}}
        ]);
        assert_eq!(result.sole_text(), None);
    }
}
