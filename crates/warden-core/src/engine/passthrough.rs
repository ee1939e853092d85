use std::time::{Instant, SystemTime};

use tracing::Instrument;
use warden_common::{Agent, ProviderKind};
use warden_provider_core::{
    Event, Headers, UpstreamEvent, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind, header_remove,
};

use super::{PassthroughCall, ProxyEngine};
use crate::auth::AuthRequest;
use crate::error::ProxyError;

/// Caller credentials replaced by the resolved upstream key.
const CALLER_AUTH_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key"];

impl ProxyEngine {
    /// Raw reverse proxy for non-completion paths. The upstream status and
    /// body come back untouched; no policy runs and nothing is recorded.
    pub async fn handle_passthrough(&self, call: PassthroughCall) -> UpstreamHttpResponse {
        let span = tracing::info_span!(
            "passthrough",
            provider = %call.provider,
            method = call.method.as_str(),
            path = %call.path_and_query,
        );
        let started = Instant::now();
        match self.passthrough(call, started).instrument(span).await {
            Ok(resp) => resp,
            Err(err) => err.into_response(),
        }
    }

    async fn passthrough(
        &self,
        call: PassthroughCall,
        started: Instant,
    ) -> Result<UpstreamHttpResponse, ProxyError> {
        let provider = self
            .registry
            .get(call.provider)
            .ok_or_else(|| ProxyError::not_found(format!("unknown provider {}", call.provider)))?;
        let global = self.global();
        let agent = Agent::new("passthrough");
        let auth = self
            .auth
            .resolve(
                AuthRequest {
                    provider: provider.as_ref(),
                    agent: &agent,
                    headers: &call.headers,
                    remote_ip: call.remote_ip,
                },
                &global.base_urls,
            )
            .await?;

        let mut headers = call.headers;
        strip_warden_headers(&mut headers);
        if auth.api_key.is_some() {
            for name in CALLER_AUTH_HEADERS {
                header_remove(&mut headers, name);
            }
        }
        let request = provider
            .build_passthrough_request(
                &auth.target(),
                call.method,
                &call.path_and_query,
                &headers,
                Some(call.body),
            )
            .map_err(|err| ProxyError::bad_request(err.to_string()))?;

        let sent = self.exec.client.send(request.clone()).await;
        let (status, error, transport_kind) = match &sent {
            Ok(resp) => (Some(resp.status), None, None),
            Err(UpstreamFailure::Transport { kind, message }) => {
                (None, Some(message.clone()), Some(*kind))
            }
            Err(UpstreamFailure::Http { status, .. }) => (Some(*status), None, None),
        };
        tracing::info!(
            status = status.unwrap_or_default(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "passthrough finished"
        );
        self.emit_passthrough(
            call.trace_id,
            call.provider,
            &request,
            status,
            error,
            transport_kind,
            started,
        )
        .await;

        match sent {
            Ok(resp) => Ok(resp),
            Err(failure) => Err(ProxyError::from_upstream_failure(provider.as_ref(), &failure)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_passthrough(
        &self,
        trace_id: Option<String>,
        provider: ProviderKind,
        request: &UpstreamHttpRequest,
        status: Option<u16>,
        error: Option<String>,
        transport_kind: Option<UpstreamTransportErrorKind>,
        started: Instant,
    ) {
        self.exec
            .events
            .emit(Event::Upstream(UpstreamEvent {
                trace_id,
                at: SystemTime::now(),
                provider: provider.to_string(),
                agent_id: None,
                model: None,
                request_method: request.method.as_str().to_string(),
                request_url: request.url.clone(),
                request_headers: request.headers.clone(),
                stream: request.is_stream,
                response_status: status,
                termination: None,
                input_tokens: None,
                output_tokens: None,
                duration_ms: started.elapsed().as_millis() as u64,
                error_message: error,
                transport_kind,
            }))
            .await;
    }
}

fn strip_warden_headers(headers: &mut Headers) {
    headers.retain(|(name, _)| !name.to_ascii_lowercase().starts_with("x-warden-"));
}
