use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::{Client, Method, Proxy};

use warden_common::GlobalConfig;
use warden_provider_core::{
    Headers, HttpMethod, UpstreamBody, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind,
};

const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Sends one request upstream. Non-2xx responses come back as `Ok` with the
/// body fully read; only transport failures are `Err`.
///
/// No retries happen at this layer or above it.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Max silence between two stream chunks before the stream is cut.
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            proxy: global
                .proxy
                .as_deref()
                .map(str::trim)
                .filter(|proxy| !proxy.is_empty())
                .map(str::to_string),
            ..Self::default()
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Pooled wreq client shared by every provider.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    client: Client,
    stream_idle_timeout: Duration,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if let Some(proxy) = config.proxy.as_deref() {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            stream_idle_timeout: config.stream_idle_timeout,
        })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
                HttpMethod::Put => Method::PUT,
                HttpMethod::Patch => Method::PATCH,
                HttpMethod::Delete => Method::DELETE,
            };
            let mut builder = req
                .headers
                .iter()
                .fold(self.client.request(method, &req.url), |builder, (name, value)| {
                    builder.header(name, value)
                });
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(transport_failure)?;
            let status = resp.status().as_u16();
            let headers = collect_headers(resp.headers());

            if !req.is_stream || !(200..300).contains(&status) {
                let body = resp.bytes().await.map_err(transport_failure)?;
                return Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                });
            }

            let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
            tokio::spawn(pump_stream(resp, tx, self.stream_idle_timeout));
            Ok(UpstreamHttpResponse {
                status,
                headers,
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

/// The channel closes on end of body, read error, or idle timeout alike;
/// callers tell them apart by whether the stream reached its end marker.
async fn pump_stream(resp: wreq::Response, tx: mpsc::Sender<Bytes>, idle: Duration) {
    let mut stream = resp.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => return,
            next = tokio::time::timeout(idle, stream.next()) => match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(err))) => {
                    tracing::warn!(error = %err, "upstream stream read failed");
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    tracing::warn!(idle_secs = idle.as_secs(), "upstream stream went idle");
                    return;
                }
            },
        };
        if tx.send(chunk).await.is_err() {
            return;
        }
    }
}

fn collect_headers(map: &wreq::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn transport_failure(err: wreq::Error) -> UpstreamFailure {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));
    let kind = if err.is_timeout() {
        if mentions(&["read", "idle"]) {
            UpstreamTransportErrorKind::ReadTimeout
        } else {
            UpstreamTransportErrorKind::Timeout
        }
    } else if mentions(&["tls", "ssl", "certificate"]) {
        UpstreamTransportErrorKind::Tls
    } else if err.is_connect() && mentions(&["dns", "resolve"]) {
        UpstreamTransportErrorKind::Dns
    } else if err.is_connect() {
        UpstreamTransportErrorKind::Connect
    } else {
        UpstreamTransportErrorKind::Other
    };
    UpstreamFailure::Transport { kind, message }
}

/// Collects a response body, draining the channel when the upstream streamed.
pub async fn read_body(body: UpstreamBody) -> Bytes {
    match body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut out = BytesMut::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out.freeze()
        }
    }
}
