use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "virtual_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub chat_api_key_id: Uuid,
    pub name: String,
    #[sea_orm(unique_key = "virtual_key_token_hash")]
    pub token_hash: String,
    pub token_prefix: String,
    pub expires_at: Option<OffsetDateTime>,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "chat_api_key_id", to = "id", on_delete = "Cascade")]
    pub chat_api_key: HasOne<super::chat_api_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
