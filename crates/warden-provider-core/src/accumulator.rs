use std::collections::BTreeMap;

use bytes::Bytes;

use crate::common::{ToolCall, Usage};

/// Everything a stream has told us so far.
///
/// Stream adapters update it chunk by chunk; the recording finalizer reads it
/// as-is, whatever state the stream ended in.
#[derive(Debug, Clone, Default)]
pub struct StreamAccumulator {
    /// Model named in the request; used for synthesized frames before upstream reports one.
    pub requested_model: String,
    pub response_id: Option<String>,
    pub model: Option<String>,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
    /// Upstream `error` frame text, if the provider reported one mid-stream.
    pub upstream_error: Option<String>,
    pub chunks_seen: u64,
    /// Raw tool-call frames held back until the invocation verdict.
    pub buffered_tool_events: Vec<Bytes>,
    /// Final frames (stop reason, usage, end marker) held back until the verdict.
    pub deferred_tail: Vec<Bytes>,
    /// Whether a message header frame has been sent to the caller.
    pub message_started: bool,
    /// Shift applied to upstream block indices after synthetic blocks were sent.
    pub block_index_offset: u32,
    pub next_block_index: u32,
    open_tool_calls: BTreeMap<u32, usize>,
}

impl StreamAccumulator {
    pub fn new(requested_model: impl Into<String>) -> Self {
        Self {
            requested_model: requested_model.into(),
            ..Default::default()
        }
    }

    pub fn upstream_started(&self) -> bool {
        self.chunks_seen > 0
    }

    pub fn usage_or_default(&self) -> Usage {
        self.usage.unwrap_or_default()
    }

    pub fn effective_model(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.requested_model)
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Registers a tool call keyed by its stream index; later fragments for the
    /// same index append to it.
    pub fn start_tool_call(&mut self, index: u32, id: String, name: String) {
        let position = self.tool_calls.len();
        self.tool_calls.push(ToolCall {
            id,
            name,
            arguments: String::new(),
            index,
        });
        self.open_tool_calls.insert(index, position);
    }

    pub fn tool_call_mut(&mut self, index: u32) -> Option<&mut ToolCall> {
        let position = *self.open_tool_calls.get(&index)?;
        self.tool_calls.get_mut(position)
    }

    pub fn is_tool_index(&self, index: u32) -> bool {
        self.open_tool_calls.contains_key(&index)
    }

    /// Usage counters reported mid-stream are cumulative; never move backwards.
    pub fn merge_usage(&mut self, input: Option<u64>, output: Option<u64>) {
        let usage = self.usage.get_or_insert_with(Usage::default);
        if let Some(input) = input {
            usage.input_tokens = usage.input_tokens.max(input);
        }
        if let Some(output) = output {
            usage.output_tokens = usage.output_tokens.max(output);
        }
    }

    pub fn reserve_block_index(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    pub fn observe_block_index(&mut self, shifted_index: u32) {
        self.next_block_index = self.next_block_index.max(shifted_index + 1);
    }

    pub fn take_tool_events(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.buffered_tool_events)
    }

    pub fn take_tail(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.deferred_tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_append_to_indexed_call() {
        let mut acc = StreamAccumulator::new("m");
        acc.start_tool_call(2, "toolu_1".into(), "read_file".into());
        acc.tool_call_mut(2).unwrap().arguments.push_str("{\"pa");
        acc.tool_call_mut(2).unwrap().arguments.push_str("th\":\"/a\"}");
        assert!(acc.tool_call_mut(0).is_none());
        assert_eq!(acc.tool_calls[0].arguments, "{\"path\":\"/a\"}");
    }

    #[test]
    fn usage_merge_is_monotonic() {
        let mut acc = StreamAccumulator::new("m");
        acc.merge_usage(Some(10), Some(1));
        acc.merge_usage(None, Some(7));
        acc.merge_usage(Some(3), None);
        assert_eq!(acc.usage_or_default().input_tokens, 10);
        assert_eq!(acc.usage_or_default().output_tokens, 7);
    }

    #[test]
    fn partial_state_still_yields_a_model() {
        let acc = StreamAccumulator::new("claude-sonnet");
        assert_eq!(acc.effective_model(), "claude-sonnet");
        assert_eq!(acc.usage_or_default(), Usage::default());
    }
}
