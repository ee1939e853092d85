//! The warden request pipeline.
//!
//! `ProxyEngine` authenticates a completion request, applies limits, cost
//! optimization, trusted-data and tool-invocation policies and TOON
//! compression, executes it upstream, and records exactly one interaction.

pub mod auth;
pub mod dual_llm;
pub mod engine;
pub mod error;
pub mod optimizer;
pub mod policy;
pub mod recorder;
pub mod tokens;
pub mod toon;
pub mod upstream_client;

pub use auth::{
    AuthFailureLimiter, AuthRequest, AuthResolver, BASE_URL_OVERRIDE_HEADER, IdentityError,
    IdentityValidator, JwksValidator, KeySource, ResolvedAuth, ValidatedIdentity,
};
pub use dual_llm::{DualLlmBackend, DualLlmError, DualLlmSubagent, ProgressSink, ProviderTextModel};
pub use engine::{AgentSelector, CompletionCall, EngineState, PassthroughCall, ProxyEngine};
pub use error::{ErrorKind, ProxyError, TOKEN_COST_LIMIT_EXCEEDED};
pub use optimizer::CostOptimizer;
pub use policy::{ENABLED_TOOLS_HEADER, ToolInvocationEvaluator, TrustVerdict, TrustedDataEvaluator};
pub use recorder::{InteractionDraft, UsageRecorder};
pub use tokens::TokenCounter;
pub use toon::{CompressionStats, SkipReason, ToonCompressor};
pub use upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
