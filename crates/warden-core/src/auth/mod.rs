//! Credential resolution for completion and passthrough requests.
//!
//! Order: JWKS identity token (agents linked to an identity provider), then
//! virtual key, then the raw provider key from the caller's headers. Keyless
//! providers only serve unauthenticated callers on loopback.

mod jwks;
mod limiter;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use uuid::Uuid;
use warden_common::{Agent, ProviderBaseUrls};
use warden_provider_core::{
    AuthFailureEvent, Event, EventHub, Headers, LlmProvider, UpstreamTarget, header_get,
};
use warden_storage::{Storage, VirtualKeyError, is_virtual_key};

use crate::error::ProxyError;

pub use jwks::{
    IdentityError, IdentityValidator, JWKS_CACHE_TTL, JwksValidator, ValidatedIdentity,
    looks_like_jwt,
};
pub use limiter::AuthFailureLimiter;

/// Upstream base URL override; honored only from loopback callers.
pub const BASE_URL_OVERRIDE_HEADER: &str = "x-warden-base-url";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Jwks,
    VirtualKey,
    Header,
    Keyless,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::Jwks => "jwks",
            KeySource::VirtualKey => "virtual_key",
            KeySource::Header => "header",
            KeySource::Keyless => "keyless",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAuth {
    pub api_key: Option<String>,
    pub base_url: String,
    pub source: KeySource,
    /// End user named by a validated identity token.
    pub user_id: Option<String>,
    pub virtual_key_id: Option<Uuid>,
}

impl ResolvedAuth {
    pub fn target(&self) -> UpstreamTarget {
        UpstreamTarget {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

pub struct AuthRequest<'a> {
    pub provider: &'a dyn LlmProvider,
    pub agent: &'a Agent,
    pub headers: &'a Headers,
    pub remote_ip: Option<IpAddr>,
}

pub fn is_loopback(ip: Option<IpAddr>) -> bool {
    ip.is_some_and(|ip| ip.to_canonical().is_loopback())
}

pub struct AuthResolver {
    storage: Arc<dyn Storage>,
    identity: Arc<dyn IdentityValidator>,
    limiter: AuthFailureLimiter,
    events: EventHub,
}

impl AuthResolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        identity: Arc<dyn IdentityValidator>,
        limiter: AuthFailureLimiter,
        events: EventHub,
    ) -> Self {
        Self {
            storage,
            identity,
            limiter,
            events,
        }
    }

    pub async fn resolve(
        &self,
        req: AuthRequest<'_>,
        base_urls: &ProviderBaseUrls,
    ) -> Result<ResolvedAuth, ProxyError> {
        let kind = req.provider.kind();
        let loopback = is_loopback(req.remote_ip);
        if let Some(ip) = req.remote_ip
            && self.limiter.is_locked(ip)
        {
            return Err(ProxyError::rate_limited(
                "too many failed authentication attempts; try again later",
            ));
        }

        let default_base_url = base_urls.get(kind).to_string();
        let presented = req
            .provider
            .extract_api_key(req.headers)
            .or_else(|| warden_provider_impl::extract_caller_key(req.headers));

        let mut resolved = match presented {
            Some(token) if req.agent.identity_provider_id.is_some() && looks_like_jwt(&token) => {
                self.resolve_jwks(&req, &token, &default_base_url).await?
            }
            Some(token) if is_virtual_key(&token) => {
                match self.storage.validate_virtual_key(&token, kind).await {
                    Ok(key) => {
                        if let Some(ip) = req.remote_ip {
                            self.limiter.record_success(ip);
                        }
                        ResolvedAuth {
                            api_key: Some(key.api_key),
                            base_url: key.base_url.unwrap_or(default_base_url),
                            source: KeySource::VirtualKey,
                            user_id: None,
                            virtual_key_id: Some(key.virtual_key_id),
                        }
                    }
                    Err(VirtualKeyError::Unauthorized(message)) => {
                        return Err(self.fail(&req, message).await);
                    }
                    Err(VirtualKeyError::BadRequest(message)) => {
                        return Err(ProxyError::bad_request(message));
                    }
                    Err(VirtualKeyError::Storage(err)) => {
                        tracing::error!(error = %err, "virtual key lookup failed");
                        return Err(ProxyError::internal("credential lookup failed"));
                    }
                }
            }
            Some(token) => ResolvedAuth {
                api_key: Some(token),
                base_url: default_base_url,
                source: KeySource::Header,
                user_id: None,
                virtual_key_id: None,
            },
            None if !req.provider.requires_api_key() => ResolvedAuth {
                api_key: None,
                base_url: default_base_url,
                source: KeySource::Keyless,
                user_id: None,
                virtual_key_id: None,
            },
            None => return Err(ProxyError::unauthorized("missing API key")),
        };

        // Keyless providers serve unauthenticated callers only on loopback.
        if resolved.source == KeySource::Keyless && !loopback {
            return Err(self
                .fail(&req, format!("{kind} requires authentication for non-loopback callers"))
                .await);
        }

        if let Some(url) = header_get(req.headers, BASE_URL_OVERRIDE_HEADER)
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            if loopback {
                resolved.base_url = url.to_string();
            } else {
                tracing::warn!(remote_ip = ?req.remote_ip, "ignoring base url override from non-loopback caller");
            }
        }

        tracing::debug!(provider = %kind, source = resolved.source.as_str(), "credential resolved");
        Ok(resolved)
    }

    async fn resolve_jwks(
        &self,
        req: &AuthRequest<'_>,
        token: &str,
        default_base_url: &str,
    ) -> Result<ResolvedAuth, ProxyError> {
        let kind = req.provider.kind();
        let Some(idp_id) = req.agent.identity_provider_id else {
            return Err(ProxyError::internal("agent has no identity provider"));
        };
        let idp = match self.storage.find_identity_provider(idp_id).await {
            Ok(Some(idp)) => idp,
            Ok(None) => {
                tracing::warn!(identity_provider_id = %idp_id, "agent links a missing identity provider");
                return Err(self.fail(req, "identity provider not found".to_string()).await);
            }
            Err(err) => {
                tracing::error!(error = %err, "identity provider lookup failed");
                return Err(ProxyError::internal("credential lookup failed"));
            }
        };
        let identity = match self.identity.validate(token, &idp).await {
            Ok(identity) => identity,
            Err(err) => {
                tracing::info!(error = %err, "identity token rejected");
                return Err(self.fail(req, "invalid identity token".to_string()).await);
            }
        };

        let mut candidates = vec![identity.subject.clone()];
        candidates.extend(identity.email.clone());
        for user_id in candidates {
            match self.storage.find_chat_api_key_for_user(&user_id, kind).await {
                Ok(Some(key)) => {
                    if let Some(ip) = req.remote_ip {
                        self.limiter.record_success(ip);
                    }
                    return Ok(ResolvedAuth {
                        api_key: Some(key.api_key),
                        base_url: key.base_url.unwrap_or_else(|| default_base_url.to_string()),
                        source: KeySource::Jwks,
                        user_id: Some(identity.subject),
                        virtual_key_id: None,
                    });
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(error = %err, "chat api key lookup failed");
                    return Err(ProxyError::internal("credential lookup failed"));
                }
            }
        }
        Err(self
            .fail(req, format!("no {kind} API key configured for this user"))
            .await)
    }

    async fn fail(&self, req: &AuthRequest<'_>, reason: String) -> ProxyError {
        let locked_out = req
            .remote_ip
            .is_some_and(|ip| self.limiter.record_failure(ip));
        tracing::info!(remote_ip = ?req.remote_ip, reason = %reason, locked_out, "authentication failed");
        self.events
            .emit(Event::AuthFailure(AuthFailureEvent {
                at: SystemTime::now(),
                provider: req.provider.kind().to_string(),
                source_ip: req.remote_ip.map(|ip| ip.to_string()),
                reason: reason.clone(),
                locked_out,
            }))
            .await;
        ProxyError::unauthorized(reason)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use warden_provider_impl::{AnthropicProvider, OpenAiProvider};
    use warden_storage::{MemoryStorage, NewChatApiKey, VirtualKeyStore};

    use super::*;

    struct RejectAll;

    #[async_trait]
    impl IdentityValidator for RejectAll {
        async fn validate(
            &self,
            _token: &str,
            _provider: &warden_common::IdentityProvider,
        ) -> Result<ValidatedIdentity, IdentityError> {
            Err(IdentityError::InvalidToken("rejected".into()))
        }
    }

    fn resolver(storage: Arc<MemoryStorage>) -> AuthResolver {
        AuthResolver::new(
            storage,
            Arc::new(RejectAll),
            AuthFailureLimiter::new(2, std::time::Duration::from_secs(60), std::time::Duration::from_secs(300)),
            EventHub::default(),
        )
    }

    fn external() -> Option<IpAddr> {
        Some(IpAddr::from([198, 51, 100, 7]))
    }

    fn local() -> Option<IpAddr> {
        Some(IpAddr::from([127, 0, 0, 1]))
    }

    #[tokio::test]
    async fn raw_header_is_used_verbatim() {
        let resolver = resolver(Arc::new(MemoryStorage::new()));
        let agent = Agent::new("a");
        let headers: Headers = vec![("authorization".into(), "Bearer sk-live".into())];
        let provider = OpenAiProvider::openai();
        let auth = resolver
            .resolve(
                AuthRequest {
                    provider: &provider,
                    agent: &agent,
                    headers: &headers,
                    remote_ip: external(),
                },
                &ProviderBaseUrls::default(),
            )
            .await
            .unwrap();
        assert_eq!(auth.source, KeySource::Header);
        assert_eq!(auth.api_key.as_deref(), Some("sk-live"));
        assert_eq!(auth.base_url, "https://api.openai.com/v1");
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let resolver = resolver(Arc::new(MemoryStorage::new()));
        let agent = Agent::new("a");
        let provider = AnthropicProvider::new();
        let err = resolver
            .resolve(
                AuthRequest {
                    provider: &provider,
                    agent: &agent,
                    headers: &Vec::new(),
                    remote_ip: local(),
                },
                &ProviderBaseUrls::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn keyless_provider_only_serves_loopback() {
        let resolver = resolver(Arc::new(MemoryStorage::new()));
        let agent = Agent::new("a");
        let provider = OpenAiProvider::ollama();
        let headers: Headers = Vec::new();
        let ok = resolver
            .resolve(
                AuthRequest {
                    provider: &provider,
                    agent: &agent,
                    headers: &headers,
                    remote_ip: Some("::ffff:127.0.0.1".parse().unwrap()),
                },
                &ProviderBaseUrls::default(),
            )
            .await
            .unwrap();
        assert_eq!(ok.source, KeySource::Keyless);
        assert_eq!(ok.api_key, None);

        let err = resolver
            .resolve(
                AuthRequest {
                    provider: &provider,
                    agent: &agent,
                    headers: &headers,
                    remote_ip: external(),
                },
                &ProviderBaseUrls::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn keyless_provider_accepts_a_raw_key_from_anywhere() {
        let resolver = resolver(Arc::new(MemoryStorage::new()));
        let agent = Agent::new("a");
        let provider = OpenAiProvider::ollama();
        let headers: Headers = vec![("authorization".into(), "Bearer ollama-token".into())];
        let auth = resolver
            .resolve(
                AuthRequest {
                    provider: &provider,
                    agent: &agent,
                    headers: &headers,
                    remote_ip: external(),
                },
                &ProviderBaseUrls::default(),
            )
            .await
            .unwrap();
        assert_eq!(auth.source, KeySource::Header);
        assert_eq!(auth.api_key.as_deref(), Some("ollama-token"));
    }

    #[tokio::test]
    async fn base_url_override_requires_loopback() {
        let resolver = resolver(Arc::new(MemoryStorage::new()));
        let agent = Agent::new("a");
        let provider = OpenAiProvider::openai();
        let headers: Headers = vec![
            ("authorization".into(), "Bearer sk".into()),
            (BASE_URL_OVERRIDE_HEADER.into(), "http://169.254.169.254".into()),
        ];
        for (ip, expected) in [
            (external(), "https://api.openai.com/v1"),
            (local(), "http://169.254.169.254"),
        ] {
            let auth = resolver
                .resolve(
                    AuthRequest {
                        provider: &provider,
                        agent: &agent,
                        headers: &headers,
                        remote_ip: ip,
                    },
                    &ProviderBaseUrls::default(),
                )
                .await
                .unwrap();
            assert_eq!(auth.base_url, expected);
        }
    }

    #[tokio::test]
    async fn repeated_bad_virtual_keys_lock_the_ip() {
        let storage = Arc::new(MemoryStorage::new());
        let parent = storage
            .create_chat_api_key(NewChatApiKey {
                name: "team".into(),
                provider: warden_common::ProviderKind::OpenAi,
                api_key: "sk-parent".into(),
                base_url: None,
                user_id: None,
            })
            .await
            .unwrap();
        let good = storage.create_virtual_key(parent.id, "ci", None).await.unwrap();
        let resolver = resolver(storage);
        let agent = Agent::new("a");
        let provider = OpenAiProvider::openai();
        let bad: Headers = vec![("authorization".into(), "Bearer wvk_nope".into())];
        let good_headers: Headers =
            vec![("authorization".into(), format!("Bearer {}", good.token))];

        for _ in 0..2 {
            let err = resolver
                .resolve(
                    AuthRequest {
                        provider: &provider,
                        agent: &agent,
                        headers: &bad,
                        remote_ip: external(),
                    },
                    &ProviderBaseUrls::default(),
                )
                .await
                .unwrap_err();
            assert_eq!(err.status, http::StatusCode::UNAUTHORIZED);
        }
        let err = resolver
            .resolve(
                AuthRequest {
                    provider: &provider,
                    agent: &agent,
                    headers: &good_headers,
                    remote_ip: external(),
                },
                &ProviderBaseUrls::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, http::StatusCode::TOO_MANY_REQUESTS);

        let auth = resolver
            .resolve(
                AuthRequest {
                    provider: &provider,
                    agent: &agent,
                    headers: &good_headers,
                    remote_ip: local(),
                },
                &ProviderBaseUrls::default(),
            )
            .await
            .unwrap();
        assert_eq!(auth.source, KeySource::VirtualKey);
        assert_eq!(auth.api_key.as_deref(), Some("sk-parent"));
    }

    #[tokio::test]
    async fn jwt_for_linked_agent_goes_through_identity_validation() {
        let resolver = resolver(Arc::new(MemoryStorage::new()));
        let mut agent = Agent::new("a");
        agent.identity_provider_id = Some(Uuid::new_v4());
        let provider = OpenAiProvider::openai();
        let headers: Headers = vec![("authorization".into(), "Bearer aaa.bbb.ccc".into())];
        let err = resolver
            .resolve(
                AuthRequest {
                    provider: &provider,
                    agent: &agent,
                    headers: &headers,
                    remote_ip: external(),
                },
                &ProviderBaseUrls::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, http::StatusCode::UNAUTHORIZED);
        assert!(err.message.contains("identity provider"));
    }
}
