//! Built-in upstream providers.
//!
//! No network IO happens here: providers build `UpstreamHttpRequest`s and wrap
//! bodies and SSE events in the adapters `warden-core` drives.

mod auth_extractor;
mod providers;
mod registry;

pub use auth_extractor::{extract_bearer, extract_caller_key};
pub use providers::anthropic::AnthropicProvider;
pub use providers::openai::OpenAiProvider;
pub use registry::build_registry;
