use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Schema, TransactionTrait,
};
use time::OffsetDateTime;
use uuid::Uuid;
use warden_common::{Agent, AgentType, IdentityProvider, OptimizationRule, PolicySet, ProviderKind};

use crate::db::connect_shared;
use crate::entities;
use crate::record::{InteractionOutcome, InteractionRecord};
use crate::storage::{
    AgentDirectory, AgentLimit, ChatApiKey, CreatedVirtualKey, InteractionStore, LimitService,
    ModelPricing, NewChatApiKey, PolicyStore, PricingStore, Storage, StorageError, StorageResult,
    UsageDelta, VirtualKey, VirtualKeyStore, default_agent_name, new_default_agent,
};
use crate::virtual_key::{display_prefix, generate_token, hash_token};

#[derive(Clone)]
pub struct DbStorage {
    db: DatabaseConnection,
}

impl DbStorage {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = connect_shared(dsn).await?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn parse_provider(value: &str) -> StorageResult<ProviderKind> {
    ProviderKind::parse(value)
        .ok_or_else(|| StorageError::Invalid(format!("unknown provider '{value}'")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn agent_from_row(row: entities::agents::Model) -> StorageResult<Agent> {
    let agent_type = AgentType::parse(&row.agent_type)
        .ok_or_else(|| StorageError::Invalid(format!("unknown agent type '{}'", row.agent_type)))?;
    Ok(Agent {
        id: row.id,
        name: row.name,
        agent_type,
        consider_context_untrusted: row.consider_context_untrusted,
        identity_provider_id: row.identity_provider_id,
        is_default: row.is_default,
    })
}

fn chat_api_key_from_row(row: entities::chat_api_keys::Model) -> StorageResult<ChatApiKey> {
    Ok(ChatApiKey {
        id: row.id,
        name: row.name,
        provider: parse_provider(&row.provider)?,
        api_key: row.api_key,
        base_url: row.base_url,
        user_id: row.user_id,
        created_at: row.created_at,
    })
}

fn virtual_key_from_row(row: entities::virtual_keys::Model) -> VirtualKey {
    VirtualKey {
        id: row.id,
        chat_api_key_id: row.chat_api_key_id,
        name: row.name,
        token_prefix: row.token_prefix,
        expires_at: row.expires_at,
        last_used_at: row.last_used_at,
        created_at: row.created_at,
    }
}

fn interaction_from_row(row: entities::interactions::Model) -> StorageResult<InteractionRecord> {
    let outcome = InteractionOutcome::parse(&row.outcome)
        .ok_or_else(|| StorageError::Invalid(format!("unknown outcome '{}'", row.outcome)))?;
    Ok(InteractionRecord {
        id: row.id,
        agent_id: row.agent_id,
        user_id: row.user_id,
        provider: parse_provider(&row.provider)?,
        interaction_type: row.interaction_type,
        outcome,
        request: row.request,
        processed_request: row.processed_request,
        response: row.response,
        model: row.model,
        baseline_model: row.baseline_model,
        input_tokens: to_u64(row.input_tokens),
        output_tokens: to_u64(row.output_tokens),
        cost: row.cost,
        baseline_cost: row.baseline_cost,
        toon_tokens_before: to_u64(row.toon_tokens_before),
        toon_tokens_after: to_u64(row.toon_tokens_after),
        toon_cost_savings: row.toon_cost_savings,
        toon_skip_reason: row.toon_skip_reason,
        refusal: row.refusal,
        stop_reason: row.stop_reason,
        duration_ms: to_u64(row.duration_ms),
        created_at: row.created_at,
    })
}

#[async_trait]
impl AgentDirectory for DbStorage {
    async fn find_agent(&self, id: Uuid) -> StorageResult<Option<Agent>> {
        entities::Agents::find_by_id(id)
            .one(&self.db)
            .await?
            .map(agent_from_row)
            .transpose()
    }

    async fn get_or_create_default_agent(&self, user_agent: Option<&str>) -> StorageResult<Agent> {
        use entities::agents::Column;

        let name = default_agent_name(user_agent);
        let existing = entities::Agents::find()
            .filter(Column::IsDefault.eq(true))
            .filter(Column::Name.eq(name.as_str()))
            .order_by_asc(Column::CreatedAt)
            .one(&self.db)
            .await?;
        if let Some(row) = existing {
            return agent_from_row(row);
        }
        let agent = new_default_agent(user_agent);
        self.upsert_agent(&agent).await?;
        Ok(agent)
    }

    async fn upsert_agent(&self, agent: &Agent) -> StorageResult<()> {
        use entities::agents::{ActiveModel, Column};

        let active = ActiveModel {
            id: ActiveValue::Set(agent.id),
            name: ActiveValue::Set(agent.name.clone()),
            agent_type: ActiveValue::Set(agent.agent_type.as_str().to_string()),
            consider_context_untrusted: ActiveValue::Set(agent.consider_context_untrusted),
            identity_provider_id: ActiveValue::Set(agent.identity_provider_id),
            is_default: ActiveValue::Set(agent.is_default),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::Agents::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::Name,
                        Column::AgentType,
                        Column::ConsiderContextUntrusted,
                        Column::IdentityProviderId,
                        Column::IsDefault,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn find_identity_provider(&self, id: Uuid) -> StorageResult<Option<IdentityProvider>> {
        Ok(entities::IdentityProviders::find_by_id(id)
            .one(&self.db)
            .await?
            .map(|row| IdentityProvider {
                id: row.id,
                issuer: row.issuer,
                jwks_url: row.jwks_url,
                audience: row.audience,
            }))
    }

    async fn upsert_identity_provider(&self, provider: &IdentityProvider) -> StorageResult<()> {
        use entities::identity_providers::{ActiveModel, Column};

        let active = ActiveModel {
            id: ActiveValue::Set(provider.id),
            issuer: ActiveValue::Set(provider.issuer.clone()),
            jwks_url: ActiveValue::Set(provider.jwks_url.clone()),
            audience: ActiveValue::Set(provider.audience.clone()),
        };
        entities::IdentityProviders::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::Issuer, Column::JwksUrl, Column::Audience])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LimitService for DbStorage {
    async fn agent_limit(&self, agent_id: Uuid) -> StorageResult<Option<AgentLimit>> {
        use entities::agent_limits::Column;

        Ok(entities::AgentLimits::find()
            .filter(Column::AgentId.eq(agent_id))
            .one(&self.db)
            .await?
            .map(|row| AgentLimit {
                agent_id: row.agent_id,
                cost_limit: row.cost_limit,
                cost_used: row.cost_used,
                input_tokens: to_u64(row.input_tokens),
                output_tokens: to_u64(row.output_tokens),
            }))
    }

    async fn set_cost_limit(&self, agent_id: Uuid, cost_limit: Option<f64>) -> StorageResult<()> {
        use entities::agent_limits::{ActiveModel, Column};

        let active = ActiveModel {
            agent_id: ActiveValue::Set(agent_id),
            cost_limit: ActiveValue::Set(cost_limit),
            cost_used: ActiveValue::Set(0.0),
            input_tokens: ActiveValue::Set(0),
            output_tokens: ActiveValue::Set(0),
            ..Default::default()
        };
        entities::AgentLimits::insert(active)
            .on_conflict(
                OnConflict::column(Column::AgentId)
                    .update_column(Column::CostLimit)
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn record_usage(&self, agent_id: Uuid, usage: UsageDelta) -> StorageResult<()> {
        use entities::agent_limits::{ActiveModel, Column};

        let txn = self.db.begin().await?;
        let existing = entities::AgentLimits::find()
            .filter(Column::AgentId.eq(agent_id))
            .one(&txn)
            .await?;
        match existing {
            Some(row) => {
                let cost_used = row.cost_used + usage.cost;
                let input_tokens = row.input_tokens.saturating_add(to_i64(usage.input_tokens));
                let output_tokens = row.output_tokens.saturating_add(to_i64(usage.output_tokens));
                let mut active: ActiveModel = row.into();
                active.cost_used = ActiveValue::Set(cost_used);
                active.input_tokens = ActiveValue::Set(input_tokens);
                active.output_tokens = ActiveValue::Set(output_tokens);
                active.update(&txn).await?;
            }
            None => {
                let active = ActiveModel {
                    agent_id: ActiveValue::Set(agent_id),
                    cost_limit: ActiveValue::Set(None),
                    cost_used: ActiveValue::Set(usage.cost),
                    input_tokens: ActiveValue::Set(to_i64(usage.input_tokens)),
                    output_tokens: ActiveValue::Set(to_i64(usage.output_tokens)),
                    ..Default::default()
                };
                entities::AgentLimits::insert(active)
                    .exec_without_returning(&txn)
                    .await?;
            }
        }
        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PricingStore for DbStorage {
    async fn find_pricing(
        &self,
        model: &str,
        provider: ProviderKind,
    ) -> StorageResult<Option<ModelPricing>> {
        use entities::model_pricing::Column;

        Ok(entities::ModelPricing::find()
            .filter(Column::Provider.eq(provider.as_str()))
            .filter(Column::Model.eq(model))
            .one(&self.db)
            .await?
            .map(|row| ModelPricing {
                provider,
                model: row.model,
                input_per_million: row.input_per_million,
                output_per_million: row.output_per_million,
            }))
    }

    async fn upsert_pricing(&self, pricing: &ModelPricing) -> StorageResult<()> {
        use entities::model_pricing::Column;

        entities::ModelPricing::insert(pricing_active(pricing))
            .on_conflict(
                OnConflict::columns([Column::Provider, Column::Model])
                    .update_columns([Column::InputPerMillion, Column::OutputPerMillion])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_pricing_if_absent(&self, pricing: &ModelPricing) -> StorageResult<()> {
        use entities::model_pricing::Column;

        entities::ModelPricing::insert(pricing_active(pricing))
            .on_conflict(
                OnConflict::columns([Column::Provider, Column::Model])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}

fn pricing_active(pricing: &ModelPricing) -> entities::model_pricing::ActiveModel {
    entities::model_pricing::ActiveModel {
        provider: ActiveValue::Set(pricing.provider.as_str().to_string()),
        model: ActiveValue::Set(pricing.model.clone()),
        input_per_million: ActiveValue::Set(pricing.input_per_million),
        output_per_million: ActiveValue::Set(pricing.output_per_million),
        ..Default::default()
    }
}

#[async_trait]
impl VirtualKeyStore for DbStorage {
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
        let active = entities::chat_api_keys::ActiveModel {
            id: ActiveValue::Set(key.id),
            name: ActiveValue::Set(key.name.clone()),
            provider: ActiveValue::Set(key.provider.as_str().to_string()),
            api_key: ActiveValue::Set(key.api_key.clone()),
            base_url: ActiveValue::Set(key.base_url.clone()),
            user_id: ActiveValue::Set(key.user_id.clone()),
            created_at: ActiveValue::Set(key.created_at),
        };
        entities::ChatApiKeys::insert(active)
            .exec_without_returning(&self.db)
            .await?;
        Ok(key)
    }

    async fn delete_chat_api_key(&self, id: Uuid) -> StorageResult<bool> {
        use entities::virtual_keys::Column;

        let txn = self.db.begin().await?;
        entities::VirtualKeys::delete_many()
            .filter(Column::ChatApiKeyId.eq(id))
            .exec(&txn)
            .await?;
        let result = entities::ChatApiKeys::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;
        Ok(result.rows_affected > 0)
    }

    async fn find_chat_api_key_for_user(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> StorageResult<Option<ChatApiKey>> {
        use entities::chat_api_keys::Column;

        entities::ChatApiKeys::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Provider.eq(provider.as_str()))
            .order_by_asc(Column::CreatedAt)
            .one(&self.db)
            .await?
            .map(chat_api_key_from_row)
            .transpose()
    }

    async fn create_virtual_key(
        &self,
        chat_api_key_id: Uuid,
        name: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> StorageResult<CreatedVirtualKey> {
        if entities::ChatApiKeys::find_by_id(chat_api_key_id)
            .one(&self.db)
            .await?
            .is_none()
        {
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
        let active = entities::virtual_keys::ActiveModel {
            id: ActiveValue::Set(key.id),
            chat_api_key_id: ActiveValue::Set(chat_api_key_id),
            name: ActiveValue::Set(key.name.clone()),
            token_hash: ActiveValue::Set(hash_token(&token)),
            token_prefix: ActiveValue::Set(key.token_prefix.clone()),
            expires_at: ActiveValue::Set(expires_at),
            last_used_at: ActiveValue::Set(None),
            created_at: ActiveValue::Set(key.created_at),
        };
        entities::VirtualKeys::insert(active)
            .exec_without_returning(&self.db)
            .await?;
        Ok(CreatedVirtualKey { key, token })
    }

    async fn delete_virtual_key(&self, id: Uuid) -> StorageResult<bool> {
        let result = entities::VirtualKeys::delete_by_id(id)
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn lookup_virtual_key(
        &self,
        token_hash: &str,
    ) -> StorageResult<Option<(VirtualKey, Option<ChatApiKey>)>> {
        use entities::virtual_keys::Column;

        let Some(row) = entities::VirtualKeys::find()
            .filter(Column::TokenHash.eq(token_hash))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        let parent = entities::ChatApiKeys::find_by_id(row.chat_api_key_id)
            .one(&self.db)
            .await?
            .map(chat_api_key_from_row)
            .transpose()?;
        Ok(Some((virtual_key_from_row(row), parent)))
    }

    async fn touch_virtual_key(&self, id: Uuid, at: OffsetDateTime) -> StorageResult<()> {
        let Some(row) = entities::VirtualKeys::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::virtual_keys::ActiveModel = row.into();
        active.last_used_at = ActiveValue::Set(Some(at));
        active.update(&self.db).await?;
        Ok(())
    }
}

#[async_trait]
impl InteractionStore for DbStorage {
    async fn create_interaction(&self, record: &InteractionRecord) -> StorageResult<()> {
        let active = entities::interactions::ActiveModel {
            id: ActiveValue::Set(record.id),
            agent_id: ActiveValue::Set(record.agent_id),
            user_id: ActiveValue::Set(record.user_id.clone()),
            provider: ActiveValue::Set(record.provider.as_str().to_string()),
            interaction_type: ActiveValue::Set(record.interaction_type.clone()),
            outcome: ActiveValue::Set(record.outcome.as_str().to_string()),
            request: ActiveValue::Set(record.request.clone()),
            processed_request: ActiveValue::Set(record.processed_request.clone()),
            response: ActiveValue::Set(record.response.clone()),
            model: ActiveValue::Set(record.model.clone()),
            baseline_model: ActiveValue::Set(record.baseline_model.clone()),
            input_tokens: ActiveValue::Set(to_i64(record.input_tokens)),
            output_tokens: ActiveValue::Set(to_i64(record.output_tokens)),
            cost: ActiveValue::Set(record.cost),
            baseline_cost: ActiveValue::Set(record.baseline_cost),
            toon_tokens_before: ActiveValue::Set(to_i64(record.toon_tokens_before)),
            toon_tokens_after: ActiveValue::Set(to_i64(record.toon_tokens_after)),
            toon_cost_savings: ActiveValue::Set(record.toon_cost_savings),
            toon_skip_reason: ActiveValue::Set(record.toon_skip_reason.clone()),
            refusal: ActiveValue::Set(record.refusal.clone()),
            stop_reason: ActiveValue::Set(record.stop_reason.clone()),
            duration_ms: ActiveValue::Set(to_i64(record.duration_ms)),
            created_at: ActiveValue::Set(record.created_at),
        };
        entities::Interactions::insert(active)
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn list_interactions(
        &self,
        agent_id: Option<Uuid>,
    ) -> StorageResult<Vec<InteractionRecord>> {
        use entities::interactions::Column;

        let mut query = entities::Interactions::find().order_by_asc(Column::CreatedAt);
        if let Some(agent_id) = agent_id {
            query = query.filter(Column::AgentId.eq(agent_id));
        }
        query
            .all(&self.db)
            .await?
            .into_iter()
            .map(interaction_from_row)
            .collect()
    }
}

#[async_trait]
impl PolicyStore for DbStorage {
    async fn policy_set(&self, agent_id: Uuid) -> StorageResult<PolicySet> {
        use entities::agent_policies::Column;

        let row = entities::AgentPolicies::find()
            .filter(Column::AgentId.eq(agent_id))
            .one(&self.db)
            .await?;
        match row {
            Some(row) => Ok(serde_json::from_value(row.policy_json)?),
            None => Ok(PolicySet::default()),
        }
    }

    async fn put_policy_set(&self, agent_id: Uuid, policies: &PolicySet) -> StorageResult<()> {
        use entities::agent_policies::{ActiveModel, Column};

        let active = ActiveModel {
            agent_id: ActiveValue::Set(agent_id),
            policy_json: ActiveValue::Set(serde_json::to_value(policies)?),
            ..Default::default()
        };
        entities::AgentPolicies::insert(active)
            .on_conflict(
                OnConflict::column(Column::AgentId)
                    .update_column(Column::PolicyJson)
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn optimization_rules(&self) -> StorageResult<Vec<OptimizationRule>> {
        use entities::optimization_rules::Column;

        entities::OptimizationRules::find()
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row.rule_json).map_err(StorageError::from))
            .collect()
    }

    async fn put_optimization_rules(&self, rules: &[OptimizationRule]) -> StorageResult<()> {
        use entities::optimization_rules::ActiveModel;

        let txn = self.db.begin().await?;
        entities::OptimizationRules::delete_many().exec(&txn).await?;
        for rule in rules {
            let active = ActiveModel {
                provider: ActiveValue::Set(rule.provider.as_str().to_string()),
                priority: ActiveValue::Set(rule.priority),
                enabled: ActiveValue::Set(rule.enabled),
                rule_json: ActiveValue::Set(serde_json::to_value(rule)?),
                ..Default::default()
            };
            entities::OptimizationRules::insert(active)
                .exec_without_returning(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for DbStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Agents)
            .register(entities::IdentityProviders)
            .register(entities::AgentLimits)
            .register(entities::AgentPolicies)
            .register(entities::OptimizationRules)
            .register(entities::ModelPricing)
            .register(entities::ChatApiKeys)
            .register(entities::VirtualKeys)
            .register(entities::Interactions)
            .sync(&self.db)
            .await?;
        Ok(())
    }
}
