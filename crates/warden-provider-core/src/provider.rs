use bytes::Bytes;
use serde_json::Value as JsonValue;
use warden_common::ProviderKind;

use crate::adapter::{RequestAdapter, ResponseAdapter, StreamAdapter};
use crate::errors::{ProviderError, ProviderResult};
use crate::headers::{Headers, filter_headers, header_get, header_set};

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        [
            HttpMethod::Get,
            HttpMethod::Post,
            HttpMethod::Put,
            HttpMethod::Patch,
            HttpMethod::Delete,
        ]
        .into_iter()
        .find(|candidate| candidate.as_str().eq_ignore_ascii_case(method))
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// No HTTP response was received.
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// Non-2xx response, body fully read.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

/// Where a request goes and with which credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Headers never copied from the caller onto a passthrough request.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "accept-encoding",
];

pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// One upstream LLM vendor.
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Recorded on interactions, e.g. `anthropic:messages`.
    fn interaction_type(&self) -> &'static str;

    /// Completions path relative to both the inbound provider prefix and the upstream base URL.
    fn completions_path(&self) -> &'static str;

    fn requires_api_key(&self) -> bool {
        true
    }

    /// Caller headers copied onto completion requests.
    fn forwarded_headers(&self) -> &'static [&'static str];

    fn extract_api_key(&self, headers: &Headers) -> Option<String>;

    fn auth_headers(&self, api_key: &str) -> Headers;

    /// Sent on every completion request unless the caller supplies its own value.
    fn default_headers(&self) -> Headers {
        Vec::new()
    }

    fn create_request_adapter(&self, body: JsonValue) -> ProviderResult<Box<dyn RequestAdapter>>;

    fn create_response_adapter(&self, body: JsonValue)
    -> ProviderResult<Box<dyn ResponseAdapter>>;

    fn create_stream_adapter(&self) -> Box<dyn StreamAdapter>;

    /// A minimal non-streaming request asking `model` to answer `prompt`.
    fn text_completion_request(&self, model: &str, system: &str, prompt: &str) -> JsonValue;

    fn build_completion_request(
        &self,
        target: &UpstreamTarget,
        caller_headers: &Headers,
        body: &JsonValue,
        is_stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let mut headers = self.default_headers();
        for (name, value) in filter_headers(caller_headers, self.forwarded_headers()) {
            header_set(&mut headers, name, value);
        }
        header_set(&mut headers, "content-type", "application/json");
        if is_stream {
            header_set(&mut headers, "accept", "text/event-stream");
        }
        if let Some(key) = target.api_key.as_deref() {
            for (name, value) in self.auth_headers(key) {
                header_set(&mut headers, name, value);
            }
        }
        let body = serde_json::to_vec(body).map_err(ProviderError::invalid_request)?;
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: join_url(&target.base_url, self.completions_path()),
            headers,
            body: Some(Bytes::from(body)),
            is_stream,
        })
    }

    /// Raw reverse-proxy request for any non-completion path.
    fn build_passthrough_request(
        &self,
        target: &UpstreamTarget,
        method: HttpMethod,
        path_and_query: &str,
        caller_headers: &Headers,
        body: Option<Bytes>,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let mut headers: Headers = caller_headers
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop)))
            .cloned()
            .collect();
        if let Some(key) = target.api_key.as_deref() {
            for (name, value) in self.auth_headers(key) {
                header_set(&mut headers, name, value);
            }
        }
        let is_stream = header_get(&headers, "accept")
            .is_some_and(|accept| accept.contains("text/event-stream"));
        Ok(UpstreamHttpRequest {
            method,
            url: join_url(&target.base_url, path_and_query),
            headers,
            body: body.filter(|body| !body.is_empty()),
            is_stream,
        })
    }

    fn extract_error_message(&self, body: &[u8]) -> Option<String> {
        extract_error_message(body)
    }
}

const MAX_ERROR_DETAIL: usize = 512;

/// Best human-readable message from an upstream error body.
///
/// Understands `{"error":{"message"}}`, `{"error":"..."}`, `{"message"}` and
/// `{"detail"}`; otherwise returns a compacted excerpt of the body.
pub fn extract_error_message(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<JsonValue>(body) {
        let nested = value
            .get("error")
            .and_then(|error| match error {
                JsonValue::String(message) => Some(message.as_str()),
                JsonValue::Object(obj) => obj.get("message").and_then(JsonValue::as_str),
                _ => None,
            })
            .or_else(|| value.get("message").and_then(JsonValue::as_str))
            .or_else(|| value.get("detail").and_then(JsonValue::as_str));
        if let Some(message) = nested.filter(|message| !message.trim().is_empty()) {
            return Some(message.to_string());
        }
    }
    let text = String::from_utf8_lossy(body);
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.is_empty() {
        return None;
    }
    let mut out = compact.chars().take(MAX_ERROR_DETAIL).collect::<String>();
    if compact.chars().count() > MAX_ERROR_DETAIL {
        out.push_str("...");
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_nested_error_shapes() {
        assert_eq!(
            extract_error_message(br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            Some("Overloaded".to_string())
        );
        assert_eq!(
            extract_error_message(br#"{"error":"model not found"}"#),
            Some("model not found".to_string())
        );
        assert_eq!(
            extract_error_message(br#"{"detail":"Not Found"}"#),
            Some("Not Found".to_string())
        );
    }

    #[test]
    fn falls_back_to_compacted_body() {
        let html = b"<html>\n  <body>Bad   gateway</body>\n</html>";
        assert_eq!(
            extract_error_message(html),
            Some("<html> <body>Bad gateway</body> </html>".to_string())
        );
        assert_eq!(extract_error_message(b"   "), None);
        let long = "x".repeat(600);
        let message = extract_error_message(long.as_bytes()).unwrap();
        assert_eq!(message.len(), MAX_ERROR_DETAIL + 3);
    }

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://api.openai.com/v1/", "/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn http_method_parse() {
        assert_eq!(HttpMethod::parse("post"), Some(HttpMethod::Post));
        assert_eq!(HttpMethod::parse("OPTIONS"), None);
    }
}
