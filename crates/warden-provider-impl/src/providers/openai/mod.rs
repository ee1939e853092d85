mod request;
mod response;
mod stream;

use serde_json::Value as JsonValue;
use warden_common::ProviderKind;
use warden_provider_core::{
    Headers, LlmProvider, ProviderError, ProviderResult, RequestAdapter, ResponseAdapter,
    StreamAdapter,
};

use crate::auth_extractor;

pub use request::OpenAiRequestAdapter;
pub use response::OpenAiResponseAdapter;
pub use stream::OpenAiStreamAdapter;

const COMPLETIONS_PATH: &str = "chat/completions";
const FORWARDED_HEADERS: &[&str] = &["openai-organization", "openai-project"];

/// OpenAI Chat Completions, also used for OpenAI-compatible local backends.
#[derive(Debug, Clone, Copy)]
pub struct OpenAiProvider {
    kind: ProviderKind,
}

impl OpenAiProvider {
    pub fn openai() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
        }
    }

    /// Keyless local inference speaking the same wire format.
    pub fn ollama() -> Self {
        Self {
            kind: ProviderKind::Ollama,
        }
    }
}

impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn interaction_type(&self) -> &'static str {
        match self.kind {
            ProviderKind::Ollama => "ollama:chatCompletions",
            _ => "openai:chatCompletions",
        }
    }

    fn completions_path(&self) -> &'static str {
        COMPLETIONS_PATH
    }

    fn requires_api_key(&self) -> bool {
        self.kind != ProviderKind::Ollama
    }

    fn forwarded_headers(&self) -> &'static [&'static str] {
        FORWARDED_HEADERS
    }

    fn extract_api_key(&self, headers: &Headers) -> Option<String> {
        auth_extractor::extract_bearer(headers)
    }

    fn auth_headers(&self, api_key: &str) -> Headers {
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, api_key);
        headers
    }

    fn create_request_adapter(&self, body: JsonValue) -> ProviderResult<Box<dyn RequestAdapter>> {
        let body = super::ensure_object(body, "chat completions request")
            .map_err(ProviderError::InvalidRequest)?;
        Ok(Box::new(OpenAiRequestAdapter::new(body)))
    }

    fn create_response_adapter(
        &self,
        body: JsonValue,
    ) -> ProviderResult<Box<dyn ResponseAdapter>> {
        Ok(Box::new(OpenAiResponseAdapter::new(body)?))
    }

    fn create_stream_adapter(&self) -> Box<dyn StreamAdapter> {
        Box::new(OpenAiStreamAdapter::new())
    }

    fn text_completion_request(&self, model: &str, system: &str, prompt: &str) -> JsonValue {
        serde_json::json!({
            "model": model,
            "stream": false,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use warden_provider_core::{UpstreamTarget, header_get};

    use super::*;

    #[test]
    fn ollama_is_keyless() {
        assert!(OpenAiProvider::openai().requires_api_key());
        assert!(!OpenAiProvider::ollama().requires_api_key());
        assert_eq!(
            OpenAiProvider::ollama().interaction_type(),
            "ollama:chatCompletions"
        );
    }

    #[test]
    fn completion_request_uses_bearer_and_allowlist() {
        let caller: Headers = vec![
            ("OpenAI-Organization".into(), "org-1".into()),
            ("authorization".into(), "Bearer caller".into()),
            ("x-forwarded-for".into(), "1.2.3.4".into()),
        ];
        let target = UpstreamTarget {
            base_url: "https://api.openai.com/v1".into(),
            api_key: Some("sk-upstream".into()),
        };
        let req = OpenAiProvider::openai()
            .build_completion_request(&target, &caller, &serde_json::json!({"model": "gpt-4o"}), false)
            .unwrap();
        assert_eq!(req.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer sk-upstream"));
        assert_eq!(header_get(&req.headers, "openai-organization"), Some("org-1"));
        assert_eq!(header_get(&req.headers, "x-forwarded-for"), None);
    }

    #[test]
    fn passthrough_keeps_caller_auth() {
        let caller: Headers = vec![
            ("authorization".into(), "Bearer caller".into()),
            ("host".into(), "proxy.local".into()),
        ];
        let target = UpstreamTarget {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
        };
        let req = OpenAiProvider::openai()
            .build_passthrough_request(
                &target,
                warden_provider_core::HttpMethod::Get,
                "models?limit=2",
                &caller,
                None,
            )
            .unwrap();
        assert_eq!(req.url, "https://api.openai.com/v1/models?limit=2");
        assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer caller"));
        assert_eq!(header_get(&req.headers, "host"), None);
        assert!(req.body.is_none());
    }
}
