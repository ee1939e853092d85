//! Provider abstractions for warden.
//!
//! Nothing in here performs IO. Providers turn JSON bodies into
//! `UpstreamHttpRequest`s and wrap upstream payloads in adapters; the engine in
//! `warden-core` owns the HTTP client and the request lifecycle.

pub mod accumulator;
pub mod adapter;
pub mod common;
pub mod errors;
pub mod events;
pub mod headers;
pub mod provider;
pub mod registry;

pub use accumulator::StreamAccumulator;
pub use adapter::{ChunkOutcome, RequestAdapter, ResponseAdapter, StreamAdapter};
pub use common::{
    CommonMessage, MessageRole, Refusal, ToolCall, ToolDefinition, ToolResult, ToolResultUpdate,
    Usage,
};
pub use errors::{ProviderError, ProviderResult};
pub use events::{
    AuthFailureEvent, Event, EventHub, EventSink, InteractionEvent, TerminalEventSink,
    UpstreamEvent,
};
pub use headers::{Headers, filter_headers, header_get, header_remove, header_set, redact_headers};
pub use provider::{
    ByteStream, HttpMethod, LlmProvider, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTarget, UpstreamTransportErrorKind, extract_error_message,
};
pub use registry::ProviderRegistry;
