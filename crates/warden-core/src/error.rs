use bytes::Bytes;
use http::StatusCode;
use warden_provider_core::{
    Headers, LlmProvider, UpstreamBody, UpstreamFailure, UpstreamHttpResponse, header_set,
};

pub const TOKEN_COST_LIMIT_EXCEEDED: &str = "token_cost_limit_exceeded";

const GENERIC_UPSTREAM_MESSAGE: &str = "upstream request failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    InvalidRequest,
    NotFound,
    RateLimit,
    Api,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Api => "api_error",
        }
    }
}

/// Failure surfaced to the caller before any response bytes were sent.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{status}: {message}")]
pub struct ProxyError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
}

impl ProxyError {
    pub fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorKind::Authentication, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, ErrorKind::RateLimit, message)
    }

    pub fn cost_limit_exceeded(message: impl Into<String>) -> Self {
        Self::rate_limited(message).with_code(TOKEN_COST_LIMIT_EXCEEDED)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Api, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, ErrorKind::Api, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, ErrorKind::Api, message)
    }

    /// Upstream status passes through; unusable statuses become 500.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        let status = StatusCode::from_u16(status)
            .ok()
            .filter(|status| status.is_client_error() || status.is_server_error())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, ErrorKind::Api, message)
    }

    pub fn from_upstream_failure(provider: &dyn LlmProvider, failure: &UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Transport { message, .. } => {
                Self::bad_gateway(format!("{GENERIC_UPSTREAM_MESSAGE}: {message}"))
            }
            UpstreamFailure::Http { status, body, .. } => Self::upstream(
                *status,
                provider
                    .extract_error_message(body)
                    .unwrap_or_else(|| GENERIC_UPSTREAM_MESSAGE.to_string()),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "type": self.kind.as_str(),
                "message": self.message,
                "code": self.code,
            }
        })
    }

    pub fn into_response(self) -> UpstreamHttpResponse {
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        let body = Bytes::from(serde_json::to_vec(&self.to_json()).unwrap_or_default());
        UpstreamHttpResponse {
            status: self.status.as_u16(),
            headers,
            body: UpstreamBody::Bytes(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_provider_impl::OpenAiProvider;

    #[test]
    fn cost_limit_envelope_carries_code() {
        let err = ProxyError::cost_limit_exceeded("limit reached");
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        let json = err.to_json();
        assert_eq!(json["error"]["code"], "token_cost_limit_exceeded");
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["message"], "limit reached");
    }

    #[test]
    fn upstream_http_failure_keeps_status_and_unwraps_message() {
        let provider = OpenAiProvider::openai();
        let failure = UpstreamFailure::Http {
            status: 401,
            headers: Vec::new(),
            body: Bytes::from_static(br#"{"error":{"message":"Incorrect API key provided"}}"#),
        };
        let err = ProxyError::from_upstream_failure(&provider, &failure);
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.message, "Incorrect API key provided");
    }

    #[test]
    fn odd_upstream_status_becomes_500() {
        assert_eq!(
            ProxyError::upstream(302, "moved").status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
