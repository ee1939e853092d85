use bytes::Bytes;
use serde_json::Value as JsonValue;
use warden_protocol::{SseEvent, encode_sse};

use crate::accumulator::StreamAccumulator;
use crate::common::{CommonMessage, Refusal, ToolCall, ToolDefinition, ToolResultUpdate, Usage};
use crate::headers::Headers;

/// Mutable view of an inbound provider-native request.
pub trait RequestAdapter: Send + Sync {
    fn model(&self) -> &str;

    /// Only the model changes; messages and tools are left as sent.
    fn set_model(&mut self, model: &str);

    fn is_streaming(&self) -> bool;

    fn tools(&self) -> Vec<ToolDefinition>;

    fn has_tools(&self) -> bool {
        !self.tools().is_empty()
    }

    fn messages(&self) -> Vec<CommonMessage>;

    /// The provider-native `messages` array as it will be sent.
    fn provider_messages(&self) -> &JsonValue;

    /// Replaces the content of each addressed tool result. Unknown ids are ignored.
    fn apply_tool_result_updates(&mut self, updates: &[ToolResultUpdate]);

    fn apply_compression(&mut self, updates: &[ToolResultUpdate]) {
        self.apply_tool_result_updates(updates);
    }

    /// The body exactly as the caller sent it.
    fn original_request(&self) -> &JsonValue;

    fn to_provider_request(&self) -> JsonValue;
}

/// View of a complete (non-streaming) upstream response.
pub trait ResponseAdapter: Send + Sync {
    fn tool_calls(&self) -> Vec<ToolCall>;

    fn usage(&self) -> Usage;

    fn model(&self) -> Option<&str>;

    fn text(&self) -> String;

    fn stop_reason(&self) -> Option<&str>;

    /// Rewrites the response so it carries only the refusal text.
    fn apply_refusal(&mut self, refusal: &Refusal);

    fn to_provider_response(&self) -> JsonValue;
}

#[derive(Debug, Default)]
pub struct ChunkOutcome {
    /// Frames to forward now, in order.
    pub relay: Vec<Bytes>,
    /// The chunk belonged to a tool call and was held back.
    pub held_tool_call: bool,
    /// The upstream signalled end of message.
    pub done: bool,
}

impl ChunkOutcome {
    pub fn relay(frame: Bytes) -> Self {
        Self {
            relay: vec![frame],
            ..Default::default()
        }
    }

    pub fn held() -> Self {
        Self {
            held_tool_call: true,
            ..Default::default()
        }
    }
}

/// Per-stream state machine turning upstream SSE events into caller frames.
pub trait StreamAdapter: Send {
    fn sse_headers(&self) -> Headers {
        vec![
            ("content-type".to_string(), "text/event-stream".to_string()),
            ("cache-control".to_string(), "no-cache".to_string()),
            ("connection".to_string(), "keep-alive".to_string()),
        ]
    }

    fn process_chunk(&mut self, acc: &mut StreamAccumulator, event: &SseEvent) -> ChunkOutcome;

    /// Frames carrying `text` as one complete text block.
    fn text_events(&self, acc: &mut StreamAccumulator, text: &str) -> Vec<Bytes>;

    /// Buffered tool-call frames, verbatim and in arrival order.
    fn tool_call_events(&self, acc: &mut StreamAccumulator) -> Vec<Bytes> {
        acc.take_tool_events()
    }

    /// Closing frames. When `refused`, the stop reason no longer mentions tools.
    fn terminal_events(&self, acc: &mut StreamAccumulator, refused: bool) -> Vec<Bytes>;

    fn error_event(&self, message: &str) -> Bytes {
        let payload = serde_json::json!({
            "type": "error",
            "error": {"type": "api_error", "message": message},
        });
        encode_sse(Some("error"), &payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl StreamAdapter for Nop {
        fn process_chunk(&mut self, _: &mut StreamAccumulator, _: &SseEvent) -> ChunkOutcome {
            ChunkOutcome::default()
        }

        fn text_events(&self, _: &mut StreamAccumulator, _: &str) -> Vec<Bytes> {
            Vec::new()
        }

        fn terminal_events(&self, _: &mut StreamAccumulator, _: bool) -> Vec<Bytes> {
            Vec::new()
        }
    }

    #[test]
    fn error_frame_shape() {
        let frame = Nop.error_event("boom");
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: error\ndata: "));
        let data = text
            .lines()
            .nth(1)
            .and_then(|line| line.strip_prefix("data: "))
            .unwrap();
        let value: JsonValue = serde_json::from_str(data).unwrap();
        assert_eq!(value["error"]["type"], "api_error");
        assert_eq!(value["error"]["message"], "boom");
    }

    #[test]
    fn default_sse_headers() {
        let headers = Nop.sse_headers();
        assert!(headers.contains(&("cache-control".to_string(), "no-cache".to_string())));
        assert!(headers.contains(&("connection".to_string(), "keep-alive".to_string())));
    }
}
