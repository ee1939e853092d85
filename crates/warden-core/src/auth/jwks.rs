use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;
use warden_common::IdentityProvider;
use warden_provider_core::{HttpMethod, UpstreamHttpRequest};

use crate::upstream_client::{UpstreamClient, read_body};

pub const JWKS_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIdentity {
    pub subject: String,
    pub email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("no signing key matches token kid {0:?}")]
    UnknownKey(Option<String>),
    #[error("jwks fetch failed: {0}")]
    Fetch(String),
}

#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn validate(
        &self,
        token: &str,
        provider: &IdentityProvider,
    ) -> Result<ValidatedIdentity, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// Verifies JWTs against an issuer's published JWKS, cached per URL.
pub struct JwksValidator {
    client: Arc<dyn UpstreamClient>,
    ttl: Duration,
    cache: RwLock<HashMap<String, (JwkSet, Instant)>>,
}

impl JwksValidator {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            client,
            ttl: JWKS_CACHE_TTL,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn key_set(&self, url: &str, force_refresh: bool) -> Result<JwkSet, IdentityError> {
        if !force_refresh
            && let Some((set, fetched_at)) = self.cache.read().await.get(url)
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(set.clone());
        }
        let set = self.fetch(url).await?;
        self.cache
            .write()
            .await
            .insert(url.to_string(), (set.clone(), Instant::now()));
        Ok(set)
    }

    async fn fetch(&self, url: &str) -> Result<JwkSet, IdentityError> {
        let req = UpstreamHttpRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: vec![("accept".to_string(), "application/json".to_string())],
            body: None,
            is_stream: false,
        };
        let resp = self
            .client
            .send(req)
            .await
            .map_err(|failure| IdentityError::Fetch(format!("{failure:?}")))?;
        let status = resp.status;
        let body = read_body(resp.body).await;
        if !(200..300).contains(&status) {
            return Err(IdentityError::Fetch(format!("{url} returned {status}")));
        }
        serde_json::from_slice(&body).map_err(|err| IdentityError::Fetch(err.to_string()))
    }
}

#[async_trait]
impl IdentityValidator for JwksValidator {
    async fn validate(
        &self,
        token: &str,
        provider: &IdentityProvider,
    ) -> Result<ValidatedIdentity, IdentityError> {
        let header = decode_header(token).map_err(|err| IdentityError::InvalidToken(err.to_string()))?;

        let mut set = self.key_set(&provider.jwks_url, false).await?;
        let jwk = match header.kid.as_deref() {
            Some(kid) => match set.find(kid) {
                Some(jwk) => jwk.clone(),
                None => {
                    // Key rotation: refetch once before giving up.
                    set = self.key_set(&provider.jwks_url, true).await?;
                    set.find(kid)
                        .cloned()
                        .ok_or_else(|| IdentityError::UnknownKey(Some(kid.to_string())))?
                }
            },
            None => set
                .keys
                .first()
                .cloned()
                .ok_or(IdentityError::UnknownKey(None))?,
        };
        let key = DecodingKey::from_jwk(&jwk).map_err(|err| IdentityError::InvalidToken(err.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[provider.issuer.as_str()]);
        match provider.audience.as_deref() {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|err| IdentityError::InvalidToken(err.to_string()))?;
        Ok(ValidatedIdentity {
            subject: data.claims.sub,
            email: data.claims.email,
        })
    }
}

/// Three dot-separated segments.
pub fn looks_like_jwt(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 3 && parts.iter().all(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use uuid::Uuid;
    use warden_provider_core::{UpstreamBody, UpstreamFailure, UpstreamHttpResponse};

    use super::*;

    const SECRET: &[u8] = b"warden-jwks-test-secret-0123456789abcdefg!";
    const SECRET_B64: &str = "d2FyZGVuLWp3a3MtdGVzdC1zZWNyZXQtMDEyMzQ1Njc4OWFiY2RlZmch";

    struct JwksServer {
        fetches: AtomicUsize,
    }

    impl UpstreamClient for JwksServer {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
        {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                let body = serde_json::json!({
                    "keys": [{"kty": "oct", "kid": "k1", "alg": "HS256", "k": SECRET_B64}]
                });
                Ok(UpstreamHttpResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from(body.to_string())),
                })
            })
        }
    }

    fn identity_provider(audience: Option<&str>) -> IdentityProvider {
        IdentityProvider {
            id: Uuid::new_v4(),
            issuer: "https://idp.example.com".into(),
            jwks_url: "https://idp.example.com/.well-known/jwks.json".into(),
            audience: audience.map(str::to_string),
        }
    }

    fn token(kid: &str, iss: &str, aud: &str) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        let claims = serde_json::json!({
            "sub": "user-42",
            "email": "dev@example.com",
            "iss": iss,
            "aud": aud,
            "exp": 4_102_444_800u64,
        });
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    #[tokio::test]
    async fn validates_and_caches_key_set() {
        let server = Arc::new(JwksServer {
            fetches: AtomicUsize::new(0),
        });
        let validator = JwksValidator::new(server.clone());
        let idp = identity_provider(Some("warden"));
        let jwt = token("k1", "https://idp.example.com", "warden");
        assert!(looks_like_jwt(&jwt));

        let identity = validator.validate(&jwt, &idp).await.unwrap();
        assert_eq!(identity.subject, "user-42");
        assert_eq!(identity.email.as_deref(), Some("dev@example.com"));
        validator.validate(&jwt, &idp).await.unwrap();
        assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_wrong_issuer_and_unknown_kid() {
        let server = Arc::new(JwksServer {
            fetches: AtomicUsize::new(0),
        });
        let validator = JwksValidator::new(server.clone());
        let idp = identity_provider(None);

        let wrong_issuer = token("k1", "https://other.example.com", "x");
        assert!(matches!(
            validator.validate(&wrong_issuer, &idp).await,
            Err(IdentityError::InvalidToken(_))
        ));

        let unknown = token("k9", "https://idp.example.com", "x");
        assert!(matches!(
            validator.validate(&unknown, &idp).await,
            Err(IdentityError::UnknownKey(Some(_)))
        ));
        assert_eq!(server.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn jwt_shape() {
        assert!(!looks_like_jwt("sk-abc"));
        assert!(!looks_like_jwt("a..b"));
        assert!(looks_like_jwt("a.b.c"));
    }
}
