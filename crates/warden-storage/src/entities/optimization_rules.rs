use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "optimization_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider: String,
    pub priority: i32,
    pub enabled: bool,
    pub rule_json: Json,
}

impl ActiveModelBehavior for ActiveModel {}
