use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Not foreign-keyed to `agents`: audit rows outlive the agent they name.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "interactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Option<String>,
    pub provider: String,
    pub interaction_type: String,
    pub outcome: String,
    pub request: Json,
    pub processed_request: Json,
    pub response: Json,
    pub model: String,
    pub baseline_model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: Option<f64>,
    pub baseline_cost: Option<f64>,
    pub toon_tokens_before: i64,
    pub toon_tokens_after: i64,
    pub toon_cost_savings: Option<f64>,
    pub toon_skip_reason: Option<String>,
    pub refusal: Option<String>,
    pub stop_reason: Option<String>,
    pub duration_ms: i64,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
