//! Buffered execution.
//!
//! The work runs in its own task so a caller that goes away mid-request
//! cannot take the recording step down with it. Dropping the handler future
//! cancels the task, which then records the interaction as aborted.

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use warden_provider_core::{UpstreamBody, UpstreamFailure, UpstreamHttpResponse, Usage, header_set};
use warden_storage::InteractionOutcome;

use super::{Exec, Prepared, UpstreamOutcome, record_usage_on_span};
use crate::error::ProxyError;
use crate::policy::ToolInvocationEvaluator;
use crate::toon::CompressionStats;
use crate::upstream_client::read_body;

pub(super) async fn execute(
    exec: Exec,
    p: Prepared,
    shutdown: &CancellationToken,
) -> Result<UpstreamHttpResponse, ProxyError> {
    let cancel = shutdown.child_token();
    let guard = cancel.clone().drop_guard();
    let task = tokio::spawn(
        run(exec, p, cancel, shutdown.clone()).instrument(tracing::Span::current()),
    );
    let result = match task.await {
        Ok(result) => result,
        Err(err) => Err(ProxyError::internal(format!("completion task failed: {err}"))),
    };
    guard.disarm();
    result
}

/// Why a request stopped before it finished.
fn stop_reason(shutdown: &CancellationToken) -> &'static str {
    if shutdown.is_cancelled() {
        "cancelled"
    } else {
        "client_disconnected"
    }
}

async fn run(
    exec: Exec,
    mut p: Prepared,
    cancel: CancellationToken,
    shutdown: CancellationToken,
) -> Result<UpstreamHttpResponse, ProxyError> {
    let verdict = tokio::select! {
        verdict = exec.evaluate_trust(&p, None) => verdict,
        _ = cancel.cancelled() => {
            let processed = p.adapter.to_provider_request();
            return Err(record_abort(&exec, &p, processed, CompressionStats::default(), &shutdown).await);
        }
    };
    if !verdict.updates.is_empty() {
        p.adapter.apply_tool_result_updates(&verdict.updates);
    }
    let compression = exec.compress(&mut p).await;

    let processed = p.adapter.to_provider_request();
    let request = match p.provider.build_completion_request(
        &p.auth.target(),
        &p.headers,
        &processed,
        false,
    ) {
        Ok(request) => request,
        Err(err) => {
            let err = ProxyError::bad_request(err.to_string());
            record_failure(&exec, &p, processed, &err, compression).await;
            return Err(err);
        }
    };

    let upstream = async {
        match exec.client.send(request.clone()).await {
            Ok(resp) if (200..300).contains(&resp.status) => {
                let status = resp.status;
                Ok((status, read_body(resp.body).await))
            }
            Ok(resp) => Err(UpstreamFailure::Http {
                status: resp.status,
                headers: resp.headers,
                body: read_body(resp.body).await,
            }),
            Err(failure) => Err(failure),
        }
    };
    let sent = tokio::select! {
        sent = upstream => sent,
        _ = cancel.cancelled() => {
            exec.emit_upstream(
                &p,
                UpstreamOutcome {
                    request: &request,
                    status: None,
                    termination: Some(stop_reason(&shutdown)),
                    usage: None,
                    error: None,
                    transport_kind: None,
                },
            )
            .await;
            return Err(record_abort(&exec, &p, processed, compression, &shutdown).await);
        }
    };
    let (status, body) = match sent {
        Ok(ok) => ok,
        Err(failure) => {
            let err = ProxyError::from_upstream_failure(p.provider.as_ref(), &failure);
            let (status, transport_kind) = match &failure {
                UpstreamFailure::Http { status, .. } => (Some(*status), None),
                UpstreamFailure::Transport { kind, .. } => (None, Some(*kind)),
            };
            exec.emit_upstream(
                &p,
                UpstreamOutcome {
                    request: &request,
                    status,
                    termination: None,
                    usage: None,
                    error: Some(err.message.clone()),
                    transport_kind,
                },
            )
            .await;
            record_failure(&exec, &p, processed, &err, compression).await;
            return Err(err);
        }
    };

    let parsed = serde_json::from_slice::<JsonValue>(&body)
        .map_err(|err| err.to_string())
        .and_then(|json| {
            p.provider
                .create_response_adapter(json)
                .map_err(|err| err.to_string())
        });
    let mut response = match parsed {
        Ok(response) => response,
        Err(detail) => {
            tracing::warn!(error = %detail, "unparseable upstream response");
            let err = ProxyError::bad_gateway("upstream returned an unparseable response");
            exec.emit_upstream(
                &p,
                UpstreamOutcome {
                    request: &request,
                    status: Some(status),
                    termination: None,
                    usage: None,
                    error: Some(detail),
                    transport_kind: None,
                },
            )
            .await;
            record_failure(&exec, &p, processed, &err, compression).await;
            return Err(err);
        }
    };

    let usage = response.usage();
    let tool_calls = response.tool_calls();
    let refusal = ToolInvocationEvaluator {
        policies: &p.policies,
        tool_policy: p.global.tool_policy,
        context_trusted: verdict.context_trusted,
        enabled_tools: &p.enabled_tools,
    }
    .evaluate(&tool_calls);
    if let Some(refusal) = &refusal {
        response.apply_refusal(refusal);
    }
    let stop_reason = response.stop_reason().map(str::to_string);
    let outgoing = response.to_provider_response();

    exec.emit_upstream(
        &p,
        UpstreamOutcome {
            request: &request,
            status: Some(status),
            termination: Some("completed"),
            usage: Some(usage),
            error: None,
            transport_kind: None,
        },
    )
    .await;
    record_usage_on_span(usage, refusal.is_some());

    let outcome = if refusal.is_some() {
        InteractionOutcome::Refused
    } else {
        InteractionOutcome::Completed
    };
    let mut draft = p.draft(outcome, processed, outgoing.clone(), usage, compression);
    draft.refusal = refusal.map(|refusal| refusal.refusal_message);
    draft.stop_reason = stop_reason;
    exec.recorder.record(draft).await;

    let mut headers = Vec::new();
    header_set(&mut headers, "content-type", "application/json");
    let body = serde_json::to_vec(&outgoing)
        .map_err(|err| ProxyError::internal(format!("failed to encode response: {err}")))?;
    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Bytes(Bytes::from(body)),
    })
}

async fn record_failure(
    exec: &Exec,
    p: &Prepared,
    processed: JsonValue,
    err: &ProxyError,
    compression: CompressionStats,
) {
    record_usage_on_span(Usage::default(), false);
    let draft = p.draft(
        InteractionOutcome::Errored,
        processed,
        err.to_json(),
        Usage::default(),
        compression,
    );
    exec.recorder.record(draft).await;
}

/// Nobody is left to read the returned error when the caller disconnected;
/// on shutdown it tells the caller to come back later.
async fn record_abort(
    exec: &Exec,
    p: &Prepared,
    processed: JsonValue,
    compression: CompressionStats,
    shutdown: &CancellationToken,
) -> ProxyError {
    let reason = stop_reason(shutdown);
    tracing::info!(termination = reason, "completion aborted");
    let err = ProxyError::cancelled(format!("request aborted: {reason}"));
    record_usage_on_span(Usage::default(), false);
    let draft = p.draft(
        InteractionOutcome::Aborted,
        processed,
        err.to_json(),
        Usage::default(),
        compression,
    );
    exec.recorder.record(draft).await;
    err
}
