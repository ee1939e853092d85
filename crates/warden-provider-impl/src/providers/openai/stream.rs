use bytes::Bytes;
use serde_json::Value as JsonValue;
use warden_protocol::openai::ChatCompletionChunk;
use warden_protocol::{SseEvent, encode_sse};
use warden_provider_core::{ChunkOutcome, StreamAccumulator, StreamAdapter};

use crate::providers::{frame_data_has, rewrite_frame, system_now_secs};

/// Chat Completions SSE: content chunks flow through, chunks carrying
/// `tool_calls` deltas are held, and the finish/usage/`[DONE]` chunks are
/// deferred to the terminal frames.
#[derive(Debug, Default)]
pub struct OpenAiStreamAdapter;

impl OpenAiStreamAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn chunk_frame(acc: &mut StreamAccumulator, delta: JsonValue, finish_reason: Option<&str>) -> Bytes {
    let id = acc
        .response_id
        .get_or_insert_with(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()))
        .clone();
    let chunk = serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": system_now_secs(),
        "model": acc.effective_model(),
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
    });
    encode_sse(None, &chunk.to_string())
}

fn record_tool_deltas(acc: &mut StreamAccumulator, chunk: &ChatCompletionChunk) {
    for choice in &chunk.choices {
        for delta in choice.delta.tool_calls.iter().flatten() {
            let function = delta.function.clone().unwrap_or_default();
            if !acc.is_tool_index(delta.index) {
                acc.start_tool_call(
                    delta.index,
                    delta.id.clone().unwrap_or_default(),
                    function.name.clone().unwrap_or_default(),
                );
            }
            let Some(call) = acc.tool_call_mut(delta.index) else {
                continue;
            };
            if call.id.is_empty()
                && let Some(id) = &delta.id
            {
                call.id = id.clone();
            }
            if call.name.is_empty()
                && let Some(name) = &function.name
            {
                call.name = name.clone();
            }
            if let Some(arguments) = &function.arguments {
                call.arguments.push_str(arguments);
            }
        }
    }
}

impl StreamAdapter for OpenAiStreamAdapter {
    fn process_chunk(&mut self, acc: &mut StreamAccumulator, event: &SseEvent) -> ChunkOutcome {
        acc.chunks_seen += 1;
        if event.is_done_marker() {
            acc.deferred_tail.push(event.encode());
            return ChunkOutcome {
                done: true,
                ..Default::default()
            };
        }
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&event.data) else {
            return ChunkOutcome::relay(event.encode());
        };

        if !chunk.id.is_empty() {
            acc.response_id = Some(chunk.id.clone());
        }
        if !chunk.model.is_empty() {
            acc.model = Some(chunk.model.clone());
        }
        if let Some(usage) = &chunk.usage {
            acc.merge_usage(Some(usage.prompt_tokens), Some(usage.completion_tokens));
        }
        for choice in &chunk.choices {
            if let Some(text) = &choice.delta.content {
                acc.text.push_str(text);
            }
        }
        if let Some(reason) = chunk.finish_reason() {
            acc.stop_reason = Some(reason.to_string());
        }

        if chunk.has_tool_call_delta() {
            record_tool_deltas(acc, &chunk);
            acc.buffered_tool_events.push(event.encode());
            return ChunkOutcome::held();
        }
        if chunk.finish_reason().is_some() || (chunk.choices.is_empty() && chunk.usage.is_some()) {
            acc.deferred_tail.push(event.encode());
            return ChunkOutcome::default();
        }
        acc.message_started = true;
        ChunkOutcome::relay(event.encode())
    }

    fn text_events(&self, acc: &mut StreamAccumulator, text: &str) -> Vec<Bytes> {
        let delta = if acc.message_started {
            serde_json::json!({"content": text})
        } else {
            serde_json::json!({"role": "assistant", "content": text})
        };
        acc.message_started = true;
        vec![chunk_frame(acc, delta, None)]
    }

    fn terminal_events(&self, acc: &mut StreamAccumulator, refused: bool) -> Vec<Bytes> {
        let mut tail = acc.take_tail();
        if refused {
            let mut had_finish = false;
            tail = tail
                .iter()
                .map(|frame| {
                    if !frame_data_has(frame, "\"finish_reason\":\"") {
                        return frame.clone();
                    }
                    had_finish = true;
                    rewrite_frame(frame, |value| {
                        for choice in value
                            .get_mut("choices")
                            .and_then(JsonValue::as_array_mut)
                            .into_iter()
                            .flatten()
                        {
                            if choice.get("finish_reason").is_some_and(|reason| !reason.is_null()) {
                                choice["finish_reason"] = JsonValue::from("stop");
                            }
                            if let Some(delta) = choice.get_mut("delta").and_then(JsonValue::as_object_mut) {
                                delta.remove("tool_calls");
                            }
                        }
                    })
                })
                .collect();
            if !had_finish {
                let finish = chunk_frame(acc, serde_json::json!({}), Some("stop"));
                tail.insert(0, finish);
            }
            acc.stop_reason = Some("stop".to_string());
        }
        if !tail.iter().any(|frame| frame_data_has(frame, "[DONE]")) {
            tail.push(encode_sse(None, "[DONE]"));
        }
        tail
    }
}
