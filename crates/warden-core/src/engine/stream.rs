//! Streaming execution.
//!
//! The pipeline runs in its own task and feeds frames through a channel. The
//! caller-facing response is only built once the first frame exists, so a
//! failure before that point still reaches the caller with its real status.
//! Whatever happens afterwards, the task records exactly one interaction from
//! the accumulator state it reached.

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use warden_protocol::SseParser;
use warden_provider_core::{
    ByteStream, Refusal, StreamAccumulator, StreamAdapter, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind,
};
use warden_storage::InteractionOutcome;

use super::{Exec, Prepared, UpstreamOutcome, record_usage_on_span};
use crate::error::ProxyError;
use crate::policy::ToolInvocationEvaluator;
use crate::recorder::stream_summary;
use crate::toon::CompressionStats;
use crate::upstream_client::read_body;

const FRAME_BUFFER: usize = 32;

enum StreamItem {
    Chunk(Bytes),
    /// Failure before any frame was produced.
    Error(ProxyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Completed,
    ClientDisconnected,
    UpstreamError,
    Cancelled,
}

impl Termination {
    fn as_str(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::ClientDisconnected => "client_disconnected",
            Termination::UpstreamError => "upstream_error",
            Termination::Cancelled => "cancelled",
        }
    }
}

pub(super) async fn execute(
    exec: Exec,
    p: Prepared,
    shutdown: &CancellationToken,
) -> UpstreamHttpResponse {
    let cancel = shutdown.child_token();
    let adapter = p.provider.create_stream_adapter();
    let sse_headers = adapter.sse_headers();
    let (tx, mut rx) = mpsc::channel(FRAME_BUFFER);
    let relay = Relay {
        tx,
        cancel: cancel.clone(),
        shutdown: shutdown.clone(),
        sent_any: false,
    };
    tokio::spawn(run(exec, p, adapter, relay).instrument(tracing::Span::current()));

    let first = match rx.recv().await {
        Some(StreamItem::Chunk(first)) => first,
        Some(StreamItem::Error(err)) => return err.into_response(),
        None => {
            return ProxyError::bad_gateway("upstream stream ended before any data")
                .into_response();
        }
    };

    let (out_tx, out_rx) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(async move {
        if out_tx.send(first).await.is_err() {
            cancel.cancel();
            return;
        }
        loop {
            tokio::select! {
                _ = out_tx.closed() => {
                    cancel.cancel();
                    return;
                }
                item = rx.recv() => match item {
                    Some(StreamItem::Chunk(frame)) => {
                        if out_tx.send(frame).await.is_err() {
                            cancel.cancel();
                            return;
                        }
                    }
                    Some(StreamItem::Error(err)) => {
                        tracing::debug!(error = %err, "late pre-stream error ignored");
                    }
                    None => return,
                },
            }
        }
    });

    UpstreamHttpResponse {
        status: 200,
        headers: sse_headers,
        body: UpstreamBody::Stream(out_rx),
    }
}

struct Relay {
    tx: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    sent_any: bool,
}

impl Relay {
    /// False once the caller is gone.
    async fn send(&mut self, frames: Vec<Bytes>) -> bool {
        for frame in frames {
            if self.tx.send(StreamItem::Chunk(frame)).await.is_err() {
                self.cancel.cancel();
                return false;
            }
            self.sent_any = true;
        }
        true
    }

    fn stopped(&self) -> Termination {
        if self.shutdown.is_cancelled() {
            Termination::Cancelled
        } else {
            Termination::ClientDisconnected
        }
    }
}

/// What the finalizer needs, filled in as the stream progresses.
struct RunState {
    acc: StreamAccumulator,
    processed: JsonValue,
    compression: CompressionStats,
    request: Option<UpstreamHttpRequest>,
    status: Option<u16>,
    refusal: Option<Refusal>,
    error: Option<String>,
    transport_kind: Option<UpstreamTransportErrorKind>,
}

async fn run(exec: Exec, mut p: Prepared, mut adapter: Box<dyn StreamAdapter>, mut relay: Relay) {
    let mut st = RunState {
        acc: StreamAccumulator::new(p.adapter.model()),
        processed: p.adapter.original_request().clone(),
        compression: CompressionStats::default(),
        request: None,
        status: None,
        refusal: None,
        error: None,
        transport_kind: None,
    };

    let termination = match drive(&exec, &mut p, adapter.as_mut(), &mut relay, &mut st).await {
        Ok(termination) => termination,
        Err(err) => {
            tracing::warn!(status = err.status.as_u16(), error = %err.message, "stream failed");
            st.error = Some(err.message.clone());
            if relay.sent_any {
                let frame = adapter.error_event(&err.message);
                relay.send(vec![frame]).await;
            } else if relay.tx.send(StreamItem::Error(err)).await.is_err() {
                tracing::debug!("caller left before the stream error was reported");
            }
            Termination::UpstreamError
        }
    };
    finalize(&exec, &p, st, termination).await;
}

async fn drive(
    exec: &Exec,
    p: &mut Prepared,
    adapter: &mut dyn StreamAdapter,
    relay: &mut Relay,
    st: &mut RunState,
) -> Result<Termination, ProxyError> {
    let cancel = relay.cancel.clone();

    // Dual-LLM progress becomes visible text while the verdict is pending.
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();
    let verdict = {
        let evaluation = exec.evaluate_trust(p, Some(&progress_tx));
        tokio::pin!(evaluation);
        loop {
            tokio::select! {
                verdict = &mut evaluation => break verdict,
                Some(line) = progress_rx.recv() => {
                    let frames = adapter.text_events(&mut st.acc, &line);
                    if !relay.send(frames).await {
                        return Ok(relay.stopped());
                    }
                }
                _ = cancel.cancelled() => return Ok(relay.stopped()),
            }
        }
    };
    while let Ok(line) = progress_rx.try_recv() {
        let frames = adapter.text_events(&mut st.acc, &line);
        if !relay.send(frames).await {
            return Ok(relay.stopped());
        }
    }
    if !verdict.updates.is_empty() {
        p.adapter.apply_tool_result_updates(&verdict.updates);
    }
    st.compression = exec.compress(p).await;

    st.processed = p.adapter.to_provider_request();
    let request = p
        .provider
        .build_completion_request(&p.auth.target(), &p.headers, &st.processed, true)
        .map_err(|err| ProxyError::bad_request(err.to_string()))?;
    st.request = Some(request.clone());

    let sent = tokio::select! {
        sent = exec.client.send(request) => sent,
        _ = cancel.cancelled() => return Ok(relay.stopped()),
    };
    let resp = match sent {
        Ok(resp) => resp,
        Err(failure) => {
            if let UpstreamFailure::Transport { kind, .. } = &failure {
                st.transport_kind = Some(*kind);
            }
            return Err(ProxyError::from_upstream_failure(p.provider.as_ref(), &failure));
        }
    };
    st.status = Some(resp.status);
    if !(200..300).contains(&resp.status) {
        let failure = UpstreamFailure::Http {
            status: resp.status,
            headers: resp.headers,
            body: read_body(resp.body).await,
        };
        return Err(ProxyError::from_upstream_failure(p.provider.as_ref(), &failure));
    }

    let mut body = into_byte_stream(resp.body);
    let mut parser = SseParser::new();
    let mut done = false;
    loop {
        let chunk = tokio::select! {
            chunk = body.recv() => chunk,
            _ = cancel.cancelled() => return Ok(relay.stopped()),
        };
        let (events, ended) = match chunk {
            Some(bytes) => (parser.push_bytes(&bytes), false),
            None => (parser.finish(), true),
        };
        for event in &events {
            let outcome = adapter.process_chunk(&mut st.acc, event);
            done |= outcome.done;
            if !relay.send(outcome.relay).await {
                return Ok(relay.stopped());
            }
        }
        if ended {
            break;
        }
    }

    if let Some(message) = &st.acc.upstream_error {
        st.error = Some(message.clone());
        return Ok(Termination::UpstreamError);
    }
    if !done {
        return Err(ProxyError::bad_gateway("upstream stream ended before completion"));
    }

    let frames = if st.acc.has_tool_calls() {
        let refusal = ToolInvocationEvaluator {
            policies: &p.policies,
            tool_policy: p.global.tool_policy,
            context_trusted: verdict.context_trusted,
            enabled_tools: &p.enabled_tools,
        }
        .evaluate(&st.acc.tool_calls);
        match refusal {
            Some(refusal) => {
                st.acc.buffered_tool_events.clear();
                let mut frames = adapter.text_events(&mut st.acc, &refusal.user_message);
                frames.extend(adapter.terminal_events(&mut st.acc, true));
                st.refusal = Some(refusal);
                frames
            }
            None => {
                let mut frames = adapter.tool_call_events(&mut st.acc);
                frames.extend(adapter.terminal_events(&mut st.acc, false));
                frames
            }
        }
    } else {
        adapter.terminal_events(&mut st.acc, false)
    };
    if !relay.send(frames).await {
        return Ok(relay.stopped());
    }
    Ok(Termination::Completed)
}

fn into_byte_stream(body: UpstreamBody) -> ByteStream {
    match body {
        UpstreamBody::Stream(rx) => rx,
        UpstreamBody::Bytes(bytes) => {
            let (tx, rx) = mpsc::channel(1);
            if tx.try_send(bytes).is_err() {
                tracing::debug!("empty upstream body");
            }
            rx
        }
    }
}

async fn finalize(exec: &Exec, p: &Prepared, st: RunState, termination: Termination) {
    let usage = st.acc.usage_or_default();
    let refused = st.refusal.is_some();
    let outcome = match termination {
        _ if refused => InteractionOutcome::Refused,
        Termination::Completed => InteractionOutcome::Completed,
        Termination::ClientDisconnected | Termination::Cancelled => InteractionOutcome::Aborted,
        Termination::UpstreamError => InteractionOutcome::Errored,
    };
    tracing::info!(
        termination = termination.as_str(),
        chunks = st.acc.chunks_seen,
        "stream finished"
    );
    record_usage_on_span(usage, refused);

    if let Some(request) = &st.request {
        exec.emit_upstream(
            p,
            UpstreamOutcome {
                request,
                status: st.status,
                termination: Some(termination.as_str()),
                usage: st.acc.usage,
                error: st.error.clone(),
                transport_kind: st.transport_kind,
            },
        )
        .await;
    }

    let response = match (&st.error, st.acc.upstream_started()) {
        (Some(message), false) => serde_json::json!({
            "error": {"type": "api_error", "message": message},
        }),
        _ => stream_summary(
            &st.acc,
            st.refusal.as_ref().map(|refusal| refusal.user_message.as_str()),
        ),
    };
    let mut draft = p.draft(outcome, st.processed, response, usage, st.compression);
    draft.refusal = st.refusal.map(|refusal| refusal.refusal_message);
    draft.stop_reason = st.acc.stop_reason.clone();
    exec.recorder.record(draft).await;
}
