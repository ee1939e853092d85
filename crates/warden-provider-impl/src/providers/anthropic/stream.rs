use bytes::Bytes;
use serde_json::Value as JsonValue;
use warden_protocol::claude::{ContentBlock, ContentBlockDelta, StreamEvent, Usage as WireUsage};
use warden_protocol::{SseEvent, encode_sse};
use warden_provider_core::{ChunkOutcome, StreamAccumulator, StreamAdapter};

use crate::providers::{frame_data_has, rewrite_frame};

/// Anthropic SSE: text blocks flow through, `tool_use` blocks are held, and
/// `message_delta`/`message_stop` are deferred to the terminal frames.
#[derive(Debug, Default)]
pub struct AnthropicStreamAdapter;

impl AnthropicStreamAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn merge_wire_usage(acc: &mut StreamAccumulator, usage: &WireUsage) {
    acc.merge_usage(usage.input_tokens, usage.output_tokens);
    if let Some(merged) = acc.usage.as_mut() {
        if let Some(read) = usage.cache_read_input_tokens {
            merged.cache_read_input_tokens = merged.cache_read_input_tokens.max(read);
        }
        if let Some(created) = usage.cache_creation_input_tokens {
            merged.cache_creation_input_tokens = merged.cache_creation_input_tokens.max(created);
        }
    }
}

/// Verbatim unless synthetic blocks were injected ahead of upstream content.
fn shifted_frame(event: &SseEvent, offset: u32) -> Bytes {
    let frame = event.encode();
    if offset == 0 {
        return frame;
    }
    rewrite_frame(&frame, |value| {
        if let Some(index) = value.get("index").and_then(JsonValue::as_u64) {
            value["index"] = JsonValue::from(index + u64::from(offset));
        }
    })
}

fn frame(value: JsonValue) -> Bytes {
    let name = value
        .get("type")
        .and_then(JsonValue::as_str)
        .unwrap_or("message")
        .to_string();
    encode_sse(Some(&name), &value.to_string())
}

impl StreamAdapter for AnthropicStreamAdapter {
    fn process_chunk(&mut self, acc: &mut StreamAccumulator, event: &SseEvent) -> ChunkOutcome {
        acc.chunks_seen += 1;
        let Ok(parsed) = serde_json::from_str::<StreamEvent>(&event.data) else {
            return ChunkOutcome::relay(event.encode());
        };
        let offset = acc.block_index_offset;

        match parsed {
            StreamEvent::MessageStart { message } => {
                if !message.id.is_empty() {
                    acc.response_id = Some(message.id);
                }
                if !message.model.is_empty() {
                    acc.model = Some(message.model);
                }
                merge_wire_usage(acc, &message.usage);
                if acc.message_started {
                    return ChunkOutcome::default();
                }
                acc.message_started = true;
                ChunkOutcome::relay(event.encode())
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                acc.observe_block_index(index + offset);
                let out = shifted_frame(event, offset);
                match content_block {
                    ContentBlock::ToolUse { id, name, input } => {
                        acc.start_tool_call(index, id, name);
                        if input.as_object().is_some_and(|obj| !obj.is_empty())
                            && let Some(call) = acc.tool_call_mut(index)
                        {
                            call.arguments = input.to_string();
                        }
                        acc.buffered_tool_events.push(out);
                        ChunkOutcome::held()
                    }
                    ContentBlock::Text { text } => {
                        acc.text.push_str(&text);
                        ChunkOutcome::relay(out)
                    }
                    _ => ChunkOutcome::relay(out),
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let out = shifted_frame(event, offset);
                if acc.is_tool_index(index) {
                    if let ContentBlockDelta::InputJsonDelta { partial_json } = delta
                        && let Some(call) = acc.tool_call_mut(index)
                    {
                        call.arguments.push_str(&partial_json);
                    }
                    acc.buffered_tool_events.push(out);
                    return ChunkOutcome::held();
                }
                if let ContentBlockDelta::TextDelta { text } = delta {
                    acc.text.push_str(&text);
                }
                ChunkOutcome::relay(out)
            }
            StreamEvent::ContentBlockStop { index } => {
                let out = shifted_frame(event, offset);
                if acc.is_tool_index(index) {
                    acc.buffered_tool_events.push(out);
                    return ChunkOutcome::held();
                }
                ChunkOutcome::relay(out)
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    acc.stop_reason = delta.stop_reason;
                }
                merge_wire_usage(acc, &usage);
                acc.deferred_tail.push(event.encode());
                ChunkOutcome::default()
            }
            StreamEvent::MessageStop => {
                acc.deferred_tail.push(event.encode());
                ChunkOutcome {
                    done: true,
                    ..Default::default()
                }
            }
            StreamEvent::Ping => ChunkOutcome::relay(event.encode()),
            StreamEvent::Error { error } => {
                acc.upstream_error = Some(
                    error
                        .get("message")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string()),
                );
                ChunkOutcome::relay(event.encode())
            }
        }
    }

    fn text_events(&self, acc: &mut StreamAccumulator, text: &str) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(4);
        if !acc.message_started {
            let id = acc
                .response_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));
            frames.push(frame(serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": acc.effective_model(),
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            })));
            acc.message_started = true;
        }

        let index = acc.reserve_block_index();
        if !acc.upstream_started() {
            acc.block_index_offset = acc.next_block_index;
        }
        frames.push(frame(serde_json::json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {"type": "text", "text": ""},
        })));
        frames.push(frame(serde_json::json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "text_delta", "text": text},
        })));
        frames.push(frame(serde_json::json!({
            "type": "content_block_stop",
            "index": index,
        })));
        frames
    }

    fn terminal_events(&self, acc: &mut StreamAccumulator, refused: bool) -> Vec<Bytes> {
        let mut tail = acc.take_tail();
        if refused {
            let had_delta = tail
                .iter()
                .any(|frame| frame_data_has(frame, "\"message_delta\""));
            tail = tail
                .iter()
                .map(|out| {
                    if !frame_data_has(out, "\"message_delta\"") {
                        return out.clone();
                    }
                    rewrite_frame(out, |value| {
                        value["delta"]["stop_reason"] = JsonValue::from("end_turn");
                    })
                })
                .collect();
            if !had_delta {
                tail.insert(
                    0,
                    frame(serde_json::json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                        "usage": {"output_tokens": acc.usage_or_default().output_tokens},
                    })),
                );
            }
            acc.stop_reason = Some("end_turn".to_string());
        }
        if !tail
            .iter()
            .any(|frame| frame_data_has(frame, "\"message_stop\""))
        {
            tail.push(frame(serde_json::json!({"type": "message_stop"})));
        }
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(name: &str, data: JsonValue) -> SseEvent {
        SseEvent::new(Some(name), data.to_string())
    }

    fn tool_stream() -> Vec<SseEvent> {
        vec![
            ev("message_start", serde_json::json!({"type":"message_start","message":{"id":"msg_1","model":"claude-sonnet-4","usage":{"input_tokens":20,"output_tokens":1}}})),
            ev("content_block_start", serde_json::json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}})),
            ev("content_block_delta", serde_json::json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Let me look."}})),
            ev("content_block_stop", serde_json::json!({"type":"content_block_stop","index":0})),
            ev("content_block_start", serde_json::json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"read_file","input":{}}})),
            ev("content_block_delta", serde_json::json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}})),
            ev("content_block_delta", serde_json::json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"/a\"}"}})),
            ev("content_block_stop", serde_json::json!({"type":"content_block_stop","index":1})),
            ev("message_delta", serde_json::json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}})),
            ev("message_stop", serde_json::json!({"type":"message_stop"})),
        ]
    }

    #[test]
    fn holds_tool_use_and_defers_tail() {
        let mut adapter = AnthropicStreamAdapter::new();
        let mut acc = StreamAccumulator::new("claude-sonnet-4");
        let mut relayed = Vec::new();
        let mut done = false;
        for event in tool_stream() {
            let outcome = adapter.process_chunk(&mut acc, &event);
            relayed.extend(outcome.relay);
            done |= outcome.done;
        }
        assert!(done);
        assert_eq!(relayed.len(), 4);
        assert!(relayed.iter().all(|frame| !frame_data_has(frame, "tool_use")));
        assert_eq!(acc.buffered_tool_events.len(), 4);
        assert_eq!(acc.deferred_tail.len(), 2);
        assert_eq!(acc.tool_calls[0].arguments, "{\"path\":\"/a\"}");
        assert_eq!(acc.text, "Let me look.");
        assert_eq!(acc.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(acc.usage_or_default().input_tokens, 20);
        assert_eq!(acc.usage_or_default().output_tokens, 42);
        assert_eq!(acc.next_block_index, 2);
    }

    #[test]
    fn approved_tool_events_are_verbatim() {
        let mut adapter = AnthropicStreamAdapter::new();
        let mut acc = StreamAccumulator::new("m");
        let events = tool_stream();
        for event in &events {
            adapter.process_chunk(&mut acc, event);
        }
        let replay = adapter.tool_call_events(&mut acc);
        let expected: Vec<Bytes> = events[4..8].iter().map(SseEvent::encode).collect();
        assert_eq!(replay, expected);
        assert!(acc.buffered_tool_events.is_empty());
    }

    #[test]
    fn refusal_uses_next_block_and_rewrites_stop_reason() {
        let mut adapter = AnthropicStreamAdapter::new();
        let mut acc = StreamAccumulator::new("m");
        for event in tool_stream() {
            adapter.process_chunk(&mut acc, &event);
        }
        let text = adapter.text_events(&mut acc, "Blocked.");
        assert_eq!(text.len(), 3);
        assert!(frame_data_has(&text[0], "\"index\":2"));
        let tail = adapter.terminal_events(&mut acc, true);
        assert_eq!(tail.len(), 2);
        assert!(frame_data_has(&tail[0], "end_turn"));
        assert!(!frame_data_has(&tail[0], "tool_use"));
        assert!(frame_data_has(&tail[1], "message_stop"));
    }

    #[test]
    fn synthetic_prelude_shifts_upstream_indices() {
        let mut adapter = AnthropicStreamAdapter::new();
        let mut acc = StreamAccumulator::new("claude-sonnet-4");
        let prelude = adapter.text_events(&mut acc, "checking tool output");
        assert_eq!(prelude.len(), 4);
        assert!(frame_data_has(&prelude[0], "message_start"));
        assert_eq!(acc.block_index_offset, 1);

        let events = tool_stream();
        let start = adapter.process_chunk(&mut acc, &events[0]);
        assert!(start.relay.is_empty());
        assert_eq!(acc.response_id.as_deref(), Some("msg_1"));
        let block = adapter.process_chunk(&mut acc, &events[1]);
        assert!(frame_data_has(&block.relay[0], "\"index\":1"));
    }

    #[test]
    fn partial_stream_keeps_partial_state() {
        let mut adapter = AnthropicStreamAdapter::new();
        let mut acc = StreamAccumulator::new("m");
        for event in &tool_stream()[..6] {
            adapter.process_chunk(&mut acc, event);
        }
        assert_eq!(acc.usage_or_default().input_tokens, 20);
        assert_eq!(acc.stop_reason, None);
        assert_eq!(acc.tool_calls[0].parsed_arguments(), serde_json::json!({}));
    }
}
