use clap::Parser;
use warden_common::GlobalConfigPatch;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Policy-enforcing, cost-aware LLM proxy")]
pub(crate) struct Cli {
    #[arg(long, env = "WARDEN_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "WARDEN_PORT")]
    pub(crate) port: Option<u16>,
    /// Database DSN (sqlite/postgres/mysql), or `memory`.
    #[arg(long, env = "WARDEN_DSN")]
    pub(crate) dsn: Option<String>,
    /// Outbound proxy for upstream traffic.
    #[arg(long, env = "WARDEN_PROXY")]
    pub(crate) proxy: Option<String>,
    /// `permissive` or `restrictive`.
    #[arg(long, env = "WARDEN_TOOL_POLICY")]
    pub(crate) tool_policy: Option<String>,
    #[arg(long, env = "WARDEN_TOON_COMPRESSION", num_args = 0..=1, default_missing_value = "true")]
    pub(crate) toon_compression: Option<bool>,
    #[arg(long, env = "WARDEN_DUAL_LLM_PROVIDER")]
    pub(crate) dual_llm_provider: Option<String>,
    #[arg(long, env = "WARDEN_DUAL_LLM_MODEL")]
    pub(crate) dual_llm_model: Option<String>,
    #[arg(long, env = "WARDEN_DUAL_LLM_MAX_ROUNDS")]
    pub(crate) dual_llm_max_rounds: Option<u32>,
    #[arg(long, env = "WARDEN_ANTHROPIC_BASE_URL")]
    pub(crate) anthropic_base_url: Option<String>,
    #[arg(long, env = "WARDEN_OPENAI_BASE_URL")]
    pub(crate) openai_base_url: Option<String>,
    #[arg(long, env = "WARDEN_OLLAMA_BASE_URL")]
    pub(crate) ollama_base_url: Option<String>,
    /// Print structured events to stderr as JSON lines.
    #[arg(long, env = "WARDEN_EVENT_LOG", num_args = 0..=1, default_missing_value = "true")]
    pub(crate) event_log: Option<bool>,
    #[arg(long, env = "WARDEN_REDACT_EVENTS", num_args = 0..=1, default_missing_value = "true")]
    pub(crate) redact_events: Option<bool>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            dsn: self.dsn,
            proxy: self.proxy,
            anthropic_base_url: self.anthropic_base_url,
            openai_base_url: self.openai_base_url,
            ollama_base_url: self.ollama_base_url,
            tool_policy: self.tool_policy,
            toon_compression: self.toon_compression,
            dual_llm_provider: self.dual_llm_provider,
            dual_llm_model: self.dual_llm_model,
            dual_llm_max_rounds: self.dual_llm_max_rounds,
            event_log: self.event_log,
            event_redact_sensitive: self.redact_events,
        }
    }
}
