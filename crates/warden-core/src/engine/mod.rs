//! Request orchestration.
//!
//! A completion call moves through authentication, the cost limit check,
//! model optimization, the trusted-data pass, TOON compression, upstream
//! execution and the tool-invocation verdict, and always ends with exactly
//! one recorded interaction once it is authenticated.

mod nonstream;
mod passthrough;
mod stream;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;
use warden_common::{Agent, GlobalConfig, PolicySet, ProviderKind};
use warden_provider_core::{
    Event, EventHub, Headers, HttpMethod, LlmProvider, ProviderRegistry, RequestAdapter,
    UpstreamEvent, UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind, Usage,
    header_get,
};
use warden_storage::{InteractionOutcome, Storage};

use crate::auth::{
    AuthFailureLimiter, AuthRequest, AuthResolver, IdentityValidator, JwksValidator, ResolvedAuth,
};
use crate::dual_llm::{DualLlmSubagent, ProgressSink, ProviderTextModel};
use crate::error::ProxyError;
use crate::optimizer::CostOptimizer;
use crate::policy::{self, TrustVerdict, TrustedDataEvaluator};
use crate::recorder::{InteractionDraft, UsageRecorder};
use crate::toon::{CompressionStats, ToonCompressor};
use crate::upstream_client::UpstreamClient;

/// Process-wide state shared by every request.
pub struct EngineState {
    pub global: ArcSwap<GlobalConfig>,
    pub events: EventHub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSelector {
    /// Keyed by the caller's `User-Agent`.
    Default,
    Pinned(Uuid),
}

#[derive(Debug, Clone)]
pub struct CompletionCall {
    pub trace_id: Option<String>,
    pub provider: ProviderKind,
    pub agent: AgentSelector,
    pub headers: Headers,
    pub remote_ip: Option<IpAddr>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct PassthroughCall {
    pub trace_id: Option<String>,
    pub provider: ProviderKind,
    pub method: HttpMethod,
    pub path_and_query: String,
    pub headers: Headers,
    pub remote_ip: Option<IpAddr>,
    pub body: Bytes,
}

pub struct ProxyEngine {
    state: Arc<EngineState>,
    registry: ProviderRegistry,
    exec: Exec,
    auth: AuthResolver,
    optimizer: CostOptimizer,
    shutdown: CancellationToken,
}

impl ProxyEngine {
    pub fn new(
        global: GlobalConfig,
        storage: Arc<dyn Storage>,
        client: Arc<dyn UpstreamClient>,
        events: EventHub,
    ) -> Self {
        let identity: Arc<dyn IdentityValidator> = Arc::new(JwksValidator::new(client.clone()));
        Self::with_identity_validator(global, storage, client, events, identity)
    }

    pub fn with_identity_validator(
        global: GlobalConfig,
        storage: Arc<dyn Storage>,
        client: Arc<dyn UpstreamClient>,
        events: EventHub,
        identity: Arc<dyn IdentityValidator>,
    ) -> Self {
        let auth = AuthResolver::new(
            storage.clone(),
            identity,
            AuthFailureLimiter::default(),
            events.clone(),
        );
        Self {
            state: Arc::new(EngineState {
                global: ArcSwap::from_pointee(global),
                events: events.clone(),
            }),
            registry: warden_provider_impl::build_registry(),
            exec: Exec {
                client,
                recorder: UsageRecorder::new(storage.clone(), events.clone()),
                storage,
                events,
            },
            auth,
            optimizer: CostOptimizer::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> Arc<EngineState> {
        self.state.clone()
    }

    pub fn global(&self) -> Arc<GlobalConfig> {
        self.state.global.load_full()
    }

    pub fn replace_global(&self, global: GlobalConfig) {
        self.state.global.store(Arc::new(global));
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.exec.storage.clone()
    }

    /// Cancels every in-flight request; each still records its interaction.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn handle_completion(&self, call: CompletionCall) -> UpstreamHttpResponse {
        let span = tracing::info_span!(
            "llm_proxy",
            provider = %call.provider,
            trace_id = call.trace_id.as_deref().unwrap_or(""),
            agent_id = tracing::field::Empty,
            stream = tracing::field::Empty,
            model = tracing::field::Empty,
            optimized_model = tracing::field::Empty,
            refused = tracing::field::Empty,
            input_tokens = tracing::field::Empty,
            output_tokens = tracing::field::Empty,
        );
        match self.run_completion(call).instrument(span).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::info!(status = err.status.as_u16(), message = %err.message, "completion rejected");
                err.into_response()
            }
        }
    }

    async fn run_completion(&self, call: CompletionCall) -> Result<UpstreamHttpResponse, ProxyError> {
        let started = Instant::now();
        let global = self.global();
        let span = tracing::Span::current();

        let provider = self
            .registry
            .get(call.provider)
            .ok_or_else(|| ProxyError::not_found(format!("unknown provider {}", call.provider)))?;
        let agent = self.resolve_agent(call.agent, &call.headers).await?;
        span.record("agent_id", tracing::field::display(agent.id));

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

        let body: JsonValue = serde_json::from_slice(&call.body)
            .map_err(|err| ProxyError::bad_request(format!("invalid JSON body: {err}")))?;
        let mut adapter = provider
            .create_request_adapter(body)
            .map_err(|err| ProxyError::bad_request(err.to_string()))?;
        span.record("stream", adapter.is_streaming());
        span.record("model", adapter.model());

        let baseline_model = adapter.model().to_string();
        match self
            .exec
            .storage
            .check_limits_before_request(agent.id)
            .await
        {
            Ok(Some(violation)) => {
                tracing::info!(reason = %violation.reason, "cost limit reached");
                let err = ProxyError::cost_limit_exceeded(violation.user_message.clone());
                let request = adapter.original_request().clone();
                self.exec
                    .recorder
                    .record(InteractionDraft {
                        agent_id: agent.id,
                        user_id: auth.user_id.clone(),
                        provider: provider.kind(),
                        interaction_type: provider.interaction_type().to_string(),
                        outcome: InteractionOutcome::Refused,
                        processed_request: request.clone(),
                        request,
                        response: err.to_json(),
                        model: baseline_model.clone(),
                        baseline_model,
                        usage: Usage::default(),
                        compression: CompressionStats::default(),
                        refusal: Some(violation.reason),
                        stop_reason: None,
                        started,
                    })
                    .await;
                return Err(err);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "limit check failed; continuing");
            }
        }

        self.optimize(provider.kind(), adapter.as_mut()).await;
        if adapter.model() != baseline_model {
            span.record("optimized_model", adapter.model());
        }
        for model in [baseline_model.as_str(), adapter.model()] {
            if let Err(err) = self
                .exec
                .storage
                .ensure_model_exists(model, provider.kind())
                .await
            {
                tracing::warn!(model, error = %err, "failed to ensure pricing row");
            }
        }

        let policies = match self.exec.storage.policy_set(agent.id).await {
            Ok(policies) => policies,
            Err(err) => {
                tracing::warn!(error = %err, "policy lookup failed; using empty policy set");
                PolicySet::default()
            }
        };
        let enabled_tools = policy::enabled_tools(&call.headers, &policies);

        let prepared = Prepared {
            trace_id: call.trace_id,
            provider,
            agent,
            auth,
            headers: call.headers,
            adapter,
            baseline_model,
            policies,
            enabled_tools,
            global,
            started,
        };
        if prepared.adapter.is_streaming() {
            Ok(stream::execute(self.exec.clone(), prepared, &self.shutdown).await)
        } else {
            nonstream::execute(self.exec.clone(), prepared, &self.shutdown).await
        }
    }

    async fn resolve_agent(
        &self,
        selector: AgentSelector,
        headers: &Headers,
    ) -> Result<Agent, ProxyError> {
        let storage = &self.exec.storage;
        let found = match selector {
            AgentSelector::Default => storage
                .get_or_create_default_agent(header_get(headers, "user-agent"))
                .await
                .map(Some),
            AgentSelector::Pinned(id) => storage.find_agent(id).await,
        };
        match found {
            Ok(Some(agent)) => Ok(agent),
            Ok(None) => Err(ProxyError::not_found("agent not found")),
            Err(err) => {
                tracing::error!(error = %err, "agent lookup failed");
                Err(ProxyError::internal("agent lookup failed"))
            }
        }
    }

    async fn optimize(&self, provider: ProviderKind, adapter: &mut dyn RequestAdapter) {
        let rules = match self.exec.storage.optimization_rules().await {
            Ok(rules) => rules,
            Err(err) => {
                tracing::warn!(error = %err, "optimization rules unavailable");
                return;
            }
        };
        let messages = adapter.messages();
        if let Some(model) = self.optimizer.select_model(
            &rules,
            provider,
            adapter.model(),
            &messages,
            adapter.has_tools(),
        ) {
            tracing::info!(from = adapter.model(), to = %model, "model optimized");
            adapter.set_model(&model);
        }
    }
}

/// A request that passed authentication, limits and optimization.
pub(crate) struct Prepared {
    pub trace_id: Option<String>,
    pub provider: Arc<dyn LlmProvider>,
    pub agent: Agent,
    pub auth: ResolvedAuth,
    pub headers: Headers,
    pub adapter: Box<dyn RequestAdapter>,
    pub baseline_model: String,
    pub policies: PolicySet,
    pub enabled_tools: HashSet<String>,
    pub global: Arc<GlobalConfig>,
    pub started: Instant,
}

impl Prepared {
    pub fn draft(
        &self,
        outcome: InteractionOutcome,
        processed_request: JsonValue,
        response: JsonValue,
        usage: Usage,
        compression: CompressionStats,
    ) -> InteractionDraft {
        InteractionDraft {
            agent_id: self.agent.id,
            user_id: self.auth.user_id.clone(),
            provider: self.provider.kind(),
            interaction_type: self.provider.interaction_type().to_string(),
            outcome,
            request: self.adapter.original_request().clone(),
            processed_request,
            response,
            model: self.adapter.model().to_string(),
            baseline_model: self.baseline_model.clone(),
            usage,
            compression,
            refusal: None,
            stop_reason: None,
            started: self.started,
        }
    }
}

/// Shared handles the executors need, cheap to clone into a stream task.
#[derive(Clone)]
pub(crate) struct Exec {
    pub client: Arc<dyn UpstreamClient>,
    pub storage: Arc<dyn Storage>,
    pub recorder: UsageRecorder,
    pub events: EventHub,
}

pub(crate) struct UpstreamOutcome<'a> {
    pub request: &'a UpstreamHttpRequest,
    pub status: Option<u16>,
    pub termination: Option<&'a str>,
    pub usage: Option<Usage>,
    pub error: Option<String>,
    pub transport_kind: Option<UpstreamTransportErrorKind>,
}

impl Exec {
    /// Trusted-data pass. Dual-LLM calls go to the configured model when it
    /// belongs to this provider, otherwise to the request's own model.
    pub async fn evaluate_trust(
        &self,
        p: &Prepared,
        progress: Option<&ProgressSink>,
    ) -> TrustVerdict {
        let messages = p.adapter.messages();
        let model = if p.global.dual_llm.provider == p.provider.kind() {
            p.global.dual_llm.model.clone()
        } else {
            p.adapter.model().to_string()
        };
        let backend = ProviderTextModel::new(
            p.provider.clone(),
            self.client.clone(),
            p.auth.target(),
            model,
        );
        let subagent = DualLlmSubagent::new(Arc::new(backend), p.global.dual_llm.max_rounds);
        let verdict = TrustedDataEvaluator {
            agent: &p.agent,
            policies: &p.policies,
            tool_policy: p.global.tool_policy,
            dual_llm: Some(&subagent),
            progress,
        }
        .evaluate(&messages)
        .await;
        tracing::debug!(
            context_trusted = verdict.context_trusted,
            blocked = verdict.blocked.len(),
            sanitized = verdict.sanitized.len(),
            "trusted data evaluated"
        );
        verdict
    }

    pub async fn compress(&self, p: &mut Prepared) -> CompressionStats {
        let messages = p.adapter.messages();
        let (updates, stats) = ToonCompressor::new()
            .compress(
                &messages,
                p.global.toon_compression,
                p.adapter.model(),
                p.provider.kind(),
                self.storage.as_ref(),
            )
            .await;
        if !updates.is_empty() {
            p.adapter.apply_compression(&updates);
        }
        stats
    }

    pub async fn emit_upstream(&self, p: &Prepared, outcome: UpstreamOutcome<'_>) {
        self.events
            .emit(Event::Upstream(UpstreamEvent {
                trace_id: p.trace_id.clone(),
                at: SystemTime::now(),
                provider: p.provider.kind().to_string(),
                agent_id: Some(p.agent.id.to_string()),
                model: Some(p.adapter.model().to_string()),
                request_method: outcome.request.method.as_str().to_string(),
                request_url: outcome.request.url.clone(),
                request_headers: outcome.request.headers.clone(),
                stream: outcome.request.is_stream,
                response_status: outcome.status,
                termination: outcome.termination.map(str::to_string),
                input_tokens: outcome.usage.map(|usage| usage.input_tokens),
                output_tokens: outcome.usage.map(|usage| usage.output_tokens),
                duration_ms: p.started.elapsed().as_millis() as u64,
                error_message: outcome.error,
                transport_kind: outcome.transport_kind,
            }))
            .await;
    }
}

fn record_usage_on_span(usage: Usage, refused: bool) {
    let span = tracing::Span::current();
    span.record("input_tokens", usage.input_tokens);
    span.record("output_tokens", usage.output_tokens);
    span.record("refused", refused);
}
