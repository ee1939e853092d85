mod request;
mod response;
mod stream;

use serde_json::Value as JsonValue;
use warden_common::ProviderKind;
use warden_provider_core::{
    Headers, LlmProvider, ProviderError, ProviderResult, RequestAdapter, ResponseAdapter,
    StreamAdapter, header_get,
};

use crate::auth_extractor;

pub use request::AnthropicRequestAdapter;
pub use response::AnthropicResponseAdapter;
pub use stream::AnthropicStreamAdapter;

const INTERACTION_TYPE: &str = "anthropic:messages";
const COMPLETIONS_PATH: &str = "v1/messages";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const FORWARDED_HEADERS: &[&str] = &["anthropic-version", "anthropic-beta"];
const TEXT_COMPLETION_MAX_TOKENS: u64 = 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicProvider;

impl AnthropicProvider {
    pub fn new() -> Self {
        Self
    }
}

impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn interaction_type(&self) -> &'static str {
        INTERACTION_TYPE
    }

    fn completions_path(&self) -> &'static str {
        COMPLETIONS_PATH
    }

    fn forwarded_headers(&self) -> &'static [&'static str] {
        FORWARDED_HEADERS
    }

    fn extract_api_key(&self, headers: &Headers) -> Option<String> {
        header_get(headers, "x-api-key")
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .or_else(|| auth_extractor::extract_bearer(headers))
    }

    fn auth_headers(&self, api_key: &str) -> Headers {
        let mut headers = Vec::new();
        auth_extractor::set_header(&mut headers, "x-api-key", api_key);
        headers
    }

    fn default_headers(&self) -> Headers {
        let mut headers = Vec::new();
        auth_extractor::set_header(&mut headers, "anthropic-version", DEFAULT_ANTHROPIC_VERSION);
        headers
    }

    fn create_request_adapter(&self, body: JsonValue) -> ProviderResult<Box<dyn RequestAdapter>> {
        let body = super::ensure_object(body, "messages request")
            .map_err(ProviderError::InvalidRequest)?;
        Ok(Box::new(AnthropicRequestAdapter::new(body)))
    }

    fn create_response_adapter(
        &self,
        body: JsonValue,
    ) -> ProviderResult<Box<dyn ResponseAdapter>> {
        Ok(Box::new(AnthropicResponseAdapter::new(body)?))
    }

    fn create_stream_adapter(&self) -> Box<dyn StreamAdapter> {
        Box::new(AnthropicStreamAdapter::new())
    }

    fn text_completion_request(&self, model: &str, system: &str, prompt: &str) -> JsonValue {
        serde_json::json!({
            "model": model,
            "max_tokens": TEXT_COMPLETION_MAX_TOKENS,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        })
    }
}

#[cfg(test)]
mod tests {
    use warden_provider_core::{UpstreamTarget, header_get};

    use super::*;

    #[test]
    fn completion_request_carries_key_and_version() {
        let provider = AnthropicProvider::new();
        let caller: Headers = vec![
            ("anthropic-beta".into(), "tools-2024".into()),
            ("x-api-key".into(), "caller-key".into()),
            ("cookie".into(), "session".into()),
        ];
        let target = UpstreamTarget {
            base_url: "https://api.anthropic.com/".into(),
            api_key: Some("resolved-key".into()),
        };
        let req = provider
            .build_completion_request(&target, &caller, &serde_json::json!({"model": "m"}), true)
            .unwrap();
        assert_eq!(req.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(header_get(&req.headers, "x-api-key"), Some("resolved-key"));
        assert_eq!(header_get(&req.headers, "anthropic-version"), Some("2023-06-01"));
        assert_eq!(header_get(&req.headers, "anthropic-beta"), Some("tools-2024"));
        assert_eq!(header_get(&req.headers, "cookie"), None);
        assert!(req.is_stream);
    }

    #[test]
    fn caller_version_overrides_default() {
        let provider = AnthropicProvider::new();
        let caller: Headers = vec![("Anthropic-Version".into(), "2024-01-01".into())];
        let target = UpstreamTarget {
            base_url: "http://localhost".into(),
            api_key: None,
        };
        let req = provider
            .build_completion_request(&target, &caller, &serde_json::json!({}), false)
            .unwrap();
        assert_eq!(header_get(&req.headers, "anthropic-version"), Some("2024-01-01"));
        assert_eq!(header_get(&req.headers, "x-api-key"), None);
    }

    #[test]
    fn rejects_non_object_bodies() {
        assert!(matches!(
            AnthropicProvider::new().create_request_adapter(serde_json::json!([1])),
            Err(ProviderError::InvalidRequest(_))
        ));
    }
}
