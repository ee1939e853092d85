use serde::{Deserialize, Serialize};

use crate::{GlobalToolPolicy, ProviderKind};

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434/v1";
pub const DEFAULT_DUAL_LLM_MAX_ROUNDS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBaseUrls {
    pub anthropic: String,
    pub openai: String,
    pub ollama: String,
}

impl ProviderBaseUrls {
    pub fn get(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Ollama => &self.ollama,
        }
    }
}

impl Default for ProviderBaseUrls {
    fn default() -> Self {
        Self {
            anthropic: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
            openai: DEFAULT_OPENAI_BASE_URL.to_string(),
            ollama: DEFAULT_OLLAMA_BASE_URL.to_string(),
        }
    }
}

/// Secondary model used to adjudicate untrusted tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualLlmConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub max_rounds: u32,
}

impl Default for DualLlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            max_rounds: DEFAULT_DUAL_LLM_MAX_ROUNDS,
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN, or `memory` for the in-process store.
    pub dsn: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub base_urls: ProviderBaseUrls,
    pub tool_policy: GlobalToolPolicy,
    pub toon_compression: bool,
    pub dual_llm: DualLlmConfig,
    /// Print structured events to stderr.
    pub event_log: bool,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            dsn: "memory".to_string(),
            proxy: None,
            base_urls: ProviderBaseUrls::default(),
            tool_policy: GlobalToolPolicy::default(),
            toon_compression: false,
            dual_llm: DualLlmConfig::default(),
            event_log: false,
            event_redact_sensitive: true,
        }
    }
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub openai_base_url: Option<String>,
    pub ollama_base_url: Option<String>,
    pub tool_policy: Option<String>,
    pub toon_compression: Option<bool>,
    pub dual_llm_provider: Option<String>,
    pub dual_llm_model: Option<String>,
    pub dual_llm_max_rounds: Option<u32>,
    pub event_log: Option<bool>,
    pub event_redact_sensitive: Option<bool>,
}

macro_rules! overlay_fields {
    ($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $self.$field = $other.$field;
            }
        )+
    };
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_fields!(
            self,
            other,
            host,
            port,
            dsn,
            proxy,
            anthropic_base_url,
            openai_base_url,
            ollama_base_url,
            tool_policy,
            toon_compression,
            dual_llm_provider,
            dual_llm_model,
            dual_llm_max_rounds,
            event_log,
            event_redact_sensitive,
        );
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let defaults = GlobalConfig::default();

        let tool_policy = match self.tool_policy.as_deref() {
            Some(raw) => GlobalToolPolicy::parse(raw).ok_or_else(|| GlobalConfigError::Invalid {
                field: "tool_policy",
                message: format!("expected permissive or restrictive, got {raw:?}"),
            })?,
            None => defaults.tool_policy,
        };
        let dual_llm_provider = match self.dual_llm_provider.as_deref() {
            Some(raw) => ProviderKind::parse(raw).ok_or_else(|| GlobalConfigError::Invalid {
                field: "dual_llm_provider",
                message: format!("unknown provider {raw:?}"),
            })?,
            None => defaults.dual_llm.provider,
        };
        let dsn = self
            .dsn
            .map(|dsn| dsn.trim().to_string())
            .unwrap_or(defaults.dsn);
        if dsn.is_empty() {
            return Err(GlobalConfigError::MissingField("dsn"));
        }
        let dual_llm_max_rounds = self
            .dual_llm_max_rounds
            .unwrap_or(defaults.dual_llm.max_rounds);
        if dual_llm_max_rounds == 0 {
            return Err(GlobalConfigError::Invalid {
                field: "dual_llm_max_rounds",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(GlobalConfig {
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            dsn,
            proxy: self.proxy.filter(|proxy| !proxy.trim().is_empty()),
            base_urls: ProviderBaseUrls {
                anthropic: self
                    .anthropic_base_url
                    .unwrap_or(defaults.base_urls.anthropic),
                openai: self.openai_base_url.unwrap_or(defaults.base_urls.openai),
                ollama: self.ollama_base_url.unwrap_or(defaults.base_urls.ollama),
            },
            tool_policy,
            toon_compression: self.toon_compression.unwrap_or(defaults.toon_compression),
            dual_llm: DualLlmConfig {
                provider: dual_llm_provider,
                model: self.dual_llm_model.unwrap_or(defaults.dual_llm.model),
                max_rounds: dual_llm_max_rounds,
            },
            event_log: self.event_log.unwrap_or(defaults.event_log),
            event_redact_sensitive: self
                .event_redact_sensitive
                .unwrap_or(defaults.event_redact_sensitive),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_win() {
        let mut base = GlobalConfigPatch {
            port: Some(1000),
            tool_policy: Some("permissive".to_string()),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(2000),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.port, 2000);
        assert_eq!(config.tool_policy, GlobalToolPolicy::Permissive);
        assert_eq!(config.dsn, "memory");
    }

    #[test]
    fn rejects_unknown_tool_policy() {
        let patch = GlobalConfigPatch {
            tool_policy: Some("lenient".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GlobalConfigError::Invalid {
                field: "tool_policy",
                ..
            })
        ));
    }

    #[test]
    fn blank_proxy_is_dropped() {
        let patch = GlobalConfigPatch {
            proxy: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(patch.into_config().unwrap().proxy, None);
    }
}
