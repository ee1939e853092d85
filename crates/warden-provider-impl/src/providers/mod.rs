pub mod anthropic;
pub mod openai;

use serde_json::Value as JsonValue;
use warden_provider_core::ToolResultUpdate;

fn update_for<'a>(updates: &'a [ToolResultUpdate], id: &str) -> Option<&'a ToolResultUpdate> {
    updates.iter().find(|update| update.tool_call_id == id)
}

fn system_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn ensure_object(value: JsonValue, what: &str) -> Result<JsonValue, String> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(format!("{what} must be a JSON object"))
    }
}

/// Re-encodes one SSE frame after editing its JSON payload. Frames that do not
/// carry JSON come back unchanged.
fn rewrite_frame(frame: &bytes::Bytes, edit: impl FnOnce(&mut JsonValue)) -> bytes::Bytes {
    let mut parser = warden_protocol::SseParser::new();
    let mut events = parser.push_bytes(frame);
    events.extend(parser.finish());
    let Some(event) = events.into_iter().next() else {
        return frame.clone();
    };
    let Ok(mut value) = serde_json::from_str::<JsonValue>(&event.data) else {
        return frame.clone();
    };
    edit(&mut value);
    warden_protocol::encode_sse(event.event.as_deref(), &value.to_string())
}

fn frame_data_has(frame: &bytes::Bytes, needle: &str) -> bool {
    std::str::from_utf8(frame).is_ok_and(|text| text.contains(needle))
}
