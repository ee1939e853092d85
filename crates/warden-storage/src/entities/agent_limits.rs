use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "agent_limits")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "agent_limit_agent")]
    pub agent_id: Uuid,
    pub cost_limit: Option<f64>,
    pub cost_used: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[sea_orm(belongs_to, from = "agent_id", to = "id", on_delete = "Cascade")]
    pub agent: HasOne<super::agents::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
