use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use warden_core::{AgentSelector, CompletionCall, PassthroughCall, ProxyEngine, ProxyError};
use warden_provider_core::{Headers, HttpMethod, UpstreamBody, UpstreamHttpResponse};

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
const MAX_REQUEST_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<ProxyEngine>,
}

/// What a request under `/v1/{provider}/` turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Completion(AgentSelector),
    Passthrough,
}

pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = ProxyState { engine };
    Router::new()
        .route("/v1/{provider}/{*rest}", any(proxy_entry))
        .with_state(state)
}

/// Completion endpoints are `POST {completions_path}` and
/// `POST {agent uuid}/{completions_path}`; every other shape is forwarded
/// verbatim.
pub fn classify_route(method: &Method, rest: &str, completions_path: &str) -> RouteKind {
    if method != Method::POST {
        return RouteKind::Passthrough;
    }
    let rest = rest.trim_start_matches('/');
    if rest == completions_path {
        return RouteKind::Completion(AgentSelector::Default);
    }
    match rest.split_once('/') {
        Some((head, tail)) if tail == completions_path => match Uuid::parse_str(head) {
            Ok(agent_id) => RouteKind::Completion(AgentSelector::Pinned(agent_id)),
            Err(_) => RouteKind::Passthrough,
        },
        _ => RouteKind::Passthrough,
    }
}

async fn proxy_entry(
    State(state): State<ProxyState>,
    Path((provider, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    let trace_id = Uuid::now_v7().to_string();
    let Some(llm) = state.engine.registry().get_by_name(&provider) else {
        return to_axum_response(
            ProxyError::not_found(format!("unknown provider {provider}")).into_response(),
        );
    };
    let kind = llm.kind();

    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let route = classify_route(req.method(), &rest, llm.completions_path());
    let Some(method) = HttpMethod::parse(req.method().as_str()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{query}", rest.trim_start_matches('/')),
        None => rest.trim_start_matches('/').to_string(),
    };
    let headers = headers_to_vec(req.headers());
    let body = match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            tracing::debug!(error = %err, "failed to read request body");
            return to_axum_response(
                ProxyError::bad_request("request body could not be read").into_response(),
            );
        }
    };

    let resp = match route {
        RouteKind::Completion(agent) => {
            state
                .engine
                .handle_completion(CompletionCall {
                    trace_id: Some(trace_id),
                    provider: kind,
                    agent,
                    headers,
                    remote_ip,
                    body,
                })
                .await
        }
        RouteKind::Passthrough => {
            state
                .engine
                .handle_passthrough(PassthroughCall {
                    trace_id: Some(trace_id),
                    provider: kind,
                    method,
                    path_and_query,
                    headers,
                    remote_ip,
                    body,
                })
                .await
        }
    };
    to_axum_response(resp)
}

fn to_axum_response(resp: UpstreamHttpResponse) -> Response {
    let sse_stream =
        has_sse_content_type(&resp.headers) && matches!(&resp.body, UpstreamBody::Stream(_));
    let mut builder = Response::builder().status(resp.status);
    if let Some(h) = builder.headers_mut() {
        for (k, v) in resp.headers {
            if is_hop_by_hop_or_framing_header(&k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                h.append(name, value);
            }
        }
        if sse_stream {
            // The upstream's own connection header was dropped above.
            h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            h.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            h.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }

    let body = match resp.body {
        UpstreamBody::Bytes(b) => Body::from(b),
        UpstreamBody::Stream(rx) => {
            let rx = if sse_stream {
                wrap_sse_stream_with_heartbeat(rx)
            } else {
                rx
            };
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        }
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn has_sse_content_type(headers: &Headers) -> bool {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .is_some_and(|(_, value)| value.to_ascii_lowercase().contains("text/event-stream"))
}

/// Interleaves comment frames into an idle stream. Dropping the returned
/// receiver drops the upstream one too, which is how the engine learns the
/// caller went away.
fn wrap_sse_stream_with_heartbeat(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    [
        "content-length",
        "transfer-encoding",
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "upgrade",
    ]
    .iter()
    .any(|hop| name.eq_ignore_ascii_case(hop))
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGES: &str = "v1/messages";
    const CHAT: &str = "chat/completions";

    #[test]
    fn default_agent_completion() {
        assert_eq!(
            classify_route(&Method::POST, "v1/messages", MESSAGES),
            RouteKind::Completion(AgentSelector::Default)
        );
        assert_eq!(
            classify_route(&Method::POST, "/chat/completions", CHAT),
            RouteKind::Completion(AgentSelector::Default)
        );
    }

    #[test]
    fn uuid_segment_pins_agent() {
        let id = Uuid::new_v4();
        assert_eq!(
            classify_route(&Method::POST, &format!("{id}/chat/completions"), CHAT),
            RouteKind::Completion(AgentSelector::Pinned(id))
        );
    }

    #[test]
    fn non_uuid_segment_is_passthrough() {
        assert_eq!(
            classify_route(&Method::POST, "team-a/chat/completions", CHAT),
            RouteKind::Passthrough
        );
        assert_eq!(
            classify_route(&Method::GET, "models", CHAT),
            RouteKind::Passthrough
        );
        assert_eq!(
            classify_route(&Method::POST, "v1/messages/count_tokens", MESSAGES),
            RouteKind::Passthrough
        );
    }

    #[test]
    fn get_on_completions_path_is_passthrough() {
        assert_eq!(
            classify_route(&Method::GET, "v1/messages", MESSAGES),
            RouteKind::Passthrough
        );
    }

    #[test]
    fn framing_headers_are_dropped() {
        let resp = to_axum_response(UpstreamHttpResponse {
            status: 201,
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("Transfer-Encoding".into(), "chunked".into()),
                ("connection".into(), "close".into()),
                ("x-request-id".into(), "abc".into()),
            ],
            body: UpstreamBody::Bytes(Bytes::from_static(b"{}")),
        });
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(resp.headers().get(header::TRANSFER_ENCODING).is_none());
        assert!(resp.headers().get(header::CONNECTION).is_none());
        assert_eq!(resp.headers()["x-request-id"], "abc");
        assert!(resp.headers().get("x-accel-buffering").is_none());
    }

    #[tokio::test]
    async fn sse_response_gets_no_buffering_hints() {
        let (tx, rx) = mpsc::channel(4);
        let resp = to_axum_response(UpstreamHttpResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/event-stream".into())],
            body: UpstreamBody::Stream(rx),
        });
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(resp.headers()["x-accel-buffering"], "no");
        assert_eq!(resp.headers()[header::CONNECTION], "keep-alive");

        tx.send(Bytes::from_static(b"data: 1\n\n")).await.unwrap();
        drop(tx);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"data: 1\n\n");
    }

    #[tokio::test]
    async fn dropped_caller_releases_upstream() {
        let (upstream_tx, upstream_rx) = mpsc::channel(4);
        let caller_rx = wrap_sse_stream_with_heartbeat(upstream_rx);
        drop(caller_rx);
        tokio::time::timeout(Duration::from_secs(5), upstream_tx.closed())
            .await
            .unwrap();
    }

    #[test]
    fn header_map_flattens() {
        let mut map = HeaderMap::new();
        map.insert(header::USER_AGENT, HeaderValue::from_static("claude-cli/1.0"));
        map.append("x-tag", HeaderValue::from_static("a"));
        map.append("x-tag", HeaderValue::from_static("b"));
        let flat = headers_to_vec(&map);
        assert_eq!(flat.len(), 3);
        assert!(flat.contains(&("user-agent".to_string(), "claude-cli/1.0".to_string())));
    }
}
