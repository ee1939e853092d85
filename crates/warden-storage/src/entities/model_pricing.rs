use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_pricing")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "pricing_provider_model")]
    pub provider: String,
    #[sea_orm(unique_key = "pricing_provider_model")]
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ActiveModelBehavior for ActiveModel {}
