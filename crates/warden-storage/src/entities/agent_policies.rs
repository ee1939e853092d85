use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "agent_policies")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "agent_policy_agent")]
    pub agent_id: Uuid,
    pub policy_json: Json,
}

impl ActiveModelBehavior for ActiveModel {}
