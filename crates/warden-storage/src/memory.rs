use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;
use warden_common::{Agent, IdentityProvider, OptimizationRule, PolicySet, ProviderKind};

use crate::record::InteractionRecord;
use crate::storage::{
    AgentDirectory, AgentLimit, ChatApiKey, CreatedVirtualKey, InteractionStore, LimitService,
    ModelPricing, NewChatApiKey, PolicyStore, PricingStore, Storage, StorageError, StorageResult,
    UsageDelta, VirtualKey, VirtualKeyStore, default_agent_name, new_default_agent,
};
use crate::virtual_key::{display_prefix, generate_token, hash_token};

#[derive(Default)]
struct State {
    agents: HashMap<Uuid, Agent>,
    identity_providers: HashMap<Uuid, IdentityProvider>,
    limits: HashMap<Uuid, AgentLimit>,
    pricing: HashMap<(ProviderKind, String), ModelPricing>,
    chat_api_keys: HashMap<Uuid, ChatApiKey>,
    /// Keyed by token hash.
    virtual_keys: HashMap<String, VirtualKey>,
    interactions: Vec<InteractionRecord>,
    policies: HashMap<Uuid, PolicySet>,
    optimization_rules: Vec<OptimizationRule>,
}

/// In-process backend. Everything is lost on drop.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentDirectory for MemoryStorage {
    async fn find_agent(&self, id: Uuid) -> StorageResult<Option<Agent>> {
        Ok(self.state.read().await.agents.get(&id).cloned())
    }

    async fn get_or_create_default_agent(&self, user_agent: Option<&str>) -> StorageResult<Agent> {
        let name = default_agent_name(user_agent);
        let mut state = self.state.write().await;
        if let Some(agent) = state
            .agents
            .values()
            .find(|agent| agent.is_default && agent.name == name)
        {
            return Ok(agent.clone());
        }
        let agent = new_default_agent(user_agent);
        state.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn upsert_agent(&self, agent: &Agent) -> StorageResult<()> {
        self.state
            .write()
            .await
            .agents
            .insert(agent.id, agent.clone());
        Ok(())
    }

    async fn find_identity_provider(&self, id: Uuid) -> StorageResult<Option<IdentityProvider>> {
        Ok(self.state.read().await.identity_providers.get(&id).cloned())
    }

    async fn upsert_identity_provider(&self, provider: &IdentityProvider) -> StorageResult<()> {
        self.state
            .write()
            .await
            .identity_providers
            .insert(provider.id, provider.clone());
        Ok(())
    }
}

#[async_trait]
impl LimitService for MemoryStorage {
    async fn agent_limit(&self, agent_id: Uuid) -> StorageResult<Option<AgentLimit>> {
        Ok(self.state.read().await.limits.get(&agent_id).cloned())
    }

    async fn set_cost_limit(&self, agent_id: Uuid, cost_limit: Option<f64>) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let limit = state.limits.entry(agent_id).or_insert_with(|| AgentLimit {
            agent_id,
            ..Default::default()
        });
        limit.cost_limit = cost_limit;
        Ok(())
    }

    async fn record_usage(&self, agent_id: Uuid, usage: UsageDelta) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let limit = state.limits.entry(agent_id).or_insert_with(|| AgentLimit {
            agent_id,
            ..Default::default()
        });
        limit.cost_used += usage.cost;
        limit.input_tokens += usage.input_tokens;
        limit.output_tokens += usage.output_tokens;
        Ok(())
    }
}

#[async_trait]
impl PricingStore for MemoryStorage {
    async fn find_pricing(
        &self,
        model: &str,
        provider: ProviderKind,
    ) -> StorageResult<Option<ModelPricing>> {
        Ok(self
            .state
            .read()
            .await
            .pricing
            .get(&(provider, model.to_string()))
            .cloned())
    }

    async fn upsert_pricing(&self, pricing: &ModelPricing) -> StorageResult<()> {
        self.state
            .write()
            .await
            .pricing
            .insert((pricing.provider, pricing.model.clone()), pricing.clone());
        Ok(())
    }

    async fn insert_pricing_if_absent(&self, pricing: &ModelPricing) -> StorageResult<()> {
        self.state
            .write()
            .await
            .pricing
            .entry((pricing.provider, pricing.model.clone()))
            .or_insert_with(|| pricing.clone());
        Ok(())
    }
}

#[async_trait]
impl VirtualKeyStore for MemoryStorage {
    async fn create_chat_api_key(&self, input: NewChatApiKey) -> StorageResult<ChatApiKey> {
        let key = ChatApiKey {
            id: Uuid::new_v4(),
            name: input.name,
            provider: input.provider,
            api_key: input.api_key,
            base_url: input.base_url,
            user_id: input.user_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state
            .write()
            .await
            .chat_api_keys
            .insert(key.id, key.clone());
        Ok(key)
    }

    async fn delete_chat_api_key(&self, id: Uuid) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        let removed = state.chat_api_keys.remove(&id).is_some();
        state
            .virtual_keys
            .retain(|_, key| key.chat_api_key_id != id);
        Ok(removed)
    }

    async fn find_chat_api_key_for_user(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> StorageResult<Option<ChatApiKey>> {
        let state = self.state.read().await;
        let mut keys: Vec<&ChatApiKey> = state
            .chat_api_keys
            .values()
            .filter(|key| key.provider == provider && key.user_id.as_deref() == Some(user_id))
            .collect();
        keys.sort_by_key(|key| key.created_at);
        Ok(keys.first().map(|key| (*key).clone()))
    }

    async fn create_virtual_key(
        &self,
        chat_api_key_id: Uuid,
        name: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> StorageResult<CreatedVirtualKey> {
        let mut state = self.state.write().await;
        if !state.chat_api_keys.contains_key(&chat_api_key_id) {
            return Err(StorageError::NotFound(format!(
                "chat api key {chat_api_key_id}"
            )));
        }
        let token = generate_token();
        let key = VirtualKey {
            id: Uuid::new_v4(),
            chat_api_key_id,
            name: name.to_string(),
            token_prefix: display_prefix(&token),
            expires_at,
            last_used_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        state.virtual_keys.insert(hash_token(&token), key.clone());
        Ok(CreatedVirtualKey { key, token })
    }

    async fn delete_virtual_key(&self, id: Uuid) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        let before = state.virtual_keys.len();
        state.virtual_keys.retain(|_, key| key.id != id);
        Ok(state.virtual_keys.len() != before)
    }

    async fn lookup_virtual_key(
        &self,
        token_hash: &str,
    ) -> StorageResult<Option<(VirtualKey, Option<ChatApiKey>)>> {
        let state = self.state.read().await;
        Ok(state.virtual_keys.get(token_hash).map(|key| {
            let parent = state.chat_api_keys.get(&key.chat_api_key_id).cloned();
            (key.clone(), parent)
        }))
    }

    async fn touch_virtual_key(&self, id: Uuid, at: OffsetDateTime) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if let Some(key) = state.virtual_keys.values_mut().find(|key| key.id == id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl InteractionStore for MemoryStorage {
    async fn create_interaction(&self, record: &InteractionRecord) -> StorageResult<()> {
        self.state.write().await.interactions.push(record.clone());
        Ok(())
    }

    async fn list_interactions(
        &self,
        agent_id: Option<Uuid>,
    ) -> StorageResult<Vec<InteractionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .interactions
            .iter()
            .filter(|record| agent_id.is_none_or(|id| record.agent_id == id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PolicyStore for MemoryStorage {
    async fn policy_set(&self, agent_id: Uuid) -> StorageResult<PolicySet> {
        Ok(self
            .state
            .read()
            .await
            .policies
            .get(&agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_policy_set(&self, agent_id: Uuid, policies: &PolicySet) -> StorageResult<()> {
        self.state
            .write()
            .await
            .policies
            .insert(agent_id, policies.clone());
        Ok(())
    }

    async fn optimization_rules(&self) -> StorageResult<Vec<OptimizationRule>> {
        Ok(self.state.read().await.optimization_rules.clone())
    }

    async fn put_optimization_rules(&self, rules: &[OptimizationRule]) -> StorageResult<()> {
        self.state.write().await.optimization_rules = rules.to_vec();
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
