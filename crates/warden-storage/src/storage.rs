use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use warden_common::{Agent, IdentityProvider, OptimizationRule, PolicySet, ProviderKind};

use crate::record::InteractionRecord;
use crate::virtual_key::hash_token;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

pub const DEFAULT_AGENT_NAME: &str = "Default Agent";

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn find_agent(&self, id: Uuid) -> StorageResult<Option<Agent>>;

    /// Default agents are keyed by the caller's `User-Agent`.
    async fn get_or_create_default_agent(&self, user_agent: Option<&str>) -> StorageResult<Agent>;

    async fn upsert_agent(&self, agent: &Agent) -> StorageResult<()>;

    async fn find_identity_provider(&self, id: Uuid) -> StorageResult<Option<IdentityProvider>>;

    async fn upsert_identity_provider(&self, provider: &IdentityProvider) -> StorageResult<()>;
}

pub(crate) fn default_agent_name(user_agent: Option<&str>) -> String {
    user_agent
        .map(str::trim)
        .filter(|ua| !ua.is_empty())
        .map(|ua| ua.chars().take(200).collect())
        .unwrap_or_else(|| DEFAULT_AGENT_NAME.to_string())
}

pub(crate) fn new_default_agent(user_agent: Option<&str>) -> Agent {
    let mut agent = Agent::new(default_agent_name(user_agent));
    agent.agent_type = warden_common::AgentType::LlmProxy;
    agent.is_default = true;
    agent
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentLimit {
    pub agent_id: Uuid,
    /// USD; `None` means unlimited.
    pub cost_limit: Option<f64>,
    pub cost_used: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitViolation {
    /// Logged, never shown to the caller.
    pub reason: String,
    pub user_message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageDelta {
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait LimitService: Send + Sync {
    async fn agent_limit(&self, agent_id: Uuid) -> StorageResult<Option<AgentLimit>>;

    async fn set_cost_limit(&self, agent_id: Uuid, cost_limit: Option<f64>) -> StorageResult<()>;

    async fn record_usage(&self, agent_id: Uuid, usage: UsageDelta) -> StorageResult<()>;

    async fn check_limits_before_request(
        &self,
        agent_id: Uuid,
    ) -> StorageResult<Option<LimitViolation>> {
        let Some(limit) = self.agent_limit(agent_id).await? else {
            return Ok(None);
        };
        let Some(max) = limit.cost_limit else {
            return Ok(None);
        };
        if limit.cost_used < max {
            return Ok(None);
        }
        Ok(Some(LimitViolation {
            reason: format!(
                "agent {agent_id} used ${:.4} of a ${max:.4} cost limit",
                limit.cost_used
            ),
            user_message: "Token cost limit exceeded for this agent. Raise the limit or wait for it to reset."
                .to_string(),
        }))
    }
}

pub const DEFAULT_INPUT_PRICE_PER_MILLION: f64 = 30.0;
pub const DEFAULT_OUTPUT_PRICE_PER_MILLION: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub provider: ProviderKind,
    pub model: String,
    /// USD per million input tokens.
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn with_defaults(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            input_per_million: DEFAULT_INPUT_PRICE_PER_MILLION,
            output_per_million: DEFAULT_OUTPUT_PRICE_PER_MILLION,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

#[async_trait]
pub trait PricingStore: Send + Sync {
    async fn find_pricing(
        &self,
        model: &str,
        provider: ProviderKind,
    ) -> StorageResult<Option<ModelPricing>>;

    async fn upsert_pricing(&self, pricing: &ModelPricing) -> StorageResult<()>;

    /// Inserts `pricing` unless a row for the same model already exists.
    async fn insert_pricing_if_absent(&self, pricing: &ModelPricing) -> StorageResult<()>;

    async fn ensure_model_exists(&self, model: &str, provider: ProviderKind) -> StorageResult<()> {
        if self.find_pricing(model, provider).await?.is_some() {
            return Ok(());
        }
        self.insert_pricing_if_absent(&ModelPricing::with_defaults(provider, model))
            .await
    }

    async fn calculate_cost(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        provider: ProviderKind,
    ) -> StorageResult<Option<f64>> {
        Ok(self
            .find_pricing(model, provider)
            .await?
            .map(|pricing| pricing.cost(input_tokens, output_tokens)))
    }
}

/// Underlying provider credential that virtual keys are minted against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatApiKey {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    /// End user this key belongs to, matched against JWT subjects.
    pub user_id: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatApiKey {
    pub name: String,
    pub provider: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualKey {
    pub id: Uuid,
    pub chat_api_key_id: Uuid,
    pub name: String,
    pub token_prefix: String,
    pub expires_at: Option<OffsetDateTime>,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// The full token is only available here, at creation time.
#[derive(Debug, Clone)]
pub struct CreatedVirtualKey {
    pub key: VirtualKey,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVirtualKey {
    pub virtual_key_id: Uuid,
    pub provider: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum VirtualKeyError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[async_trait]
pub trait VirtualKeyStore: Send + Sync {
    async fn create_chat_api_key(&self, input: NewChatApiKey) -> StorageResult<ChatApiKey>;

    /// Also removes every virtual key minted against it.
    async fn delete_chat_api_key(&self, id: Uuid) -> StorageResult<bool>;

    async fn find_chat_api_key_for_user(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> StorageResult<Option<ChatApiKey>>;

    async fn create_virtual_key(
        &self,
        chat_api_key_id: Uuid,
        name: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> StorageResult<CreatedVirtualKey>;

    async fn delete_virtual_key(&self, id: Uuid) -> StorageResult<bool>;

    /// The key and its parent, if the parent still exists.
    async fn lookup_virtual_key(
        &self,
        token_hash: &str,
    ) -> StorageResult<Option<(VirtualKey, Option<ChatApiKey>)>>;

    async fn touch_virtual_key(&self, id: Uuid, at: OffsetDateTime) -> StorageResult<()>;

    /// Valid iff unexpired, parent present, and parent provider equals `provider`.
    async fn validate_virtual_key(
        &self,
        token: &str,
        provider: ProviderKind,
    ) -> Result<ResolvedVirtualKey, VirtualKeyError> {
        let Some((key, parent)) = self.lookup_virtual_key(&hash_token(token)).await? else {
            return Err(VirtualKeyError::Unauthorized("invalid virtual key".to_string()));
        };
        let now = OffsetDateTime::now_utc();
        if key.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(VirtualKeyError::Unauthorized("virtual key has expired".to_string()));
        }
        let Some(parent) = parent else {
            return Err(VirtualKeyError::Unauthorized(
                "virtual key is no longer backed by an API key".to_string(),
            ));
        };
        if parent.provider != provider {
            return Err(VirtualKeyError::BadRequest(format!(
                "virtual key belongs to provider '{}' and cannot be used with '{}'",
                parent.provider, provider
            )));
        }
        if let Err(err) = self.touch_virtual_key(key.id, now).await {
            tracing::warn!(virtual_key_id = %key.id, error = %err, "failed to update virtual key last_used_at");
        }
        Ok(ResolvedVirtualKey {
            virtual_key_id: key.id,
            provider: parent.provider,
            api_key: parent.api_key,
            base_url: parent.base_url,
        })
    }
}

#[async_trait]
pub trait InteractionStore: Send + Sync {
    async fn create_interaction(&self, record: &InteractionRecord) -> StorageResult<()>;

    /// Oldest first.
    async fn list_interactions(
        &self,
        agent_id: Option<Uuid>,
    ) -> StorageResult<Vec<InteractionRecord>>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Empty when the agent has none stored.
    async fn policy_set(&self, agent_id: Uuid) -> StorageResult<PolicySet>;

    async fn put_policy_set(&self, agent_id: Uuid, policies: &PolicySet) -> StorageResult<()>;

    async fn optimization_rules(&self) -> StorageResult<Vec<OptimizationRule>>;

    async fn put_optimization_rules(&self, rules: &[OptimizationRule]) -> StorageResult<()>;
}

#[async_trait]
pub trait Storage:
    AgentDirectory + LimitService + PricingStore + VirtualKeyStore + InteractionStore + PolicyStore
{
    /// Entity-first schema sync. A no-op for in-memory backends.
    async fn sync(&self) -> StorageResult<()>;
}
