use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use warden_common::ProviderKind;
use warden_storage::{
    DbStorage, MemoryStorage, NewChatApiKey, Storage, VIRTUAL_KEY_PREFIX, VirtualKeyError,
};

async fn backends() -> Vec<(&'static str, Arc<dyn Storage>)> {
    let db = DbStorage::new(sea_orm::Database::connect("sqlite::memory:").await.unwrap());
    db.sync().await.unwrap();
    vec![
        ("memory", Arc::new(MemoryStorage::new()) as Arc<dyn Storage>),
        ("sqlite", Arc::new(db) as Arc<dyn Storage>),
    ]
}

fn openai_key(user: &str) -> NewChatApiKey {
    NewChatApiKey {
        name: "team key".to_string(),
        provider: ProviderKind::OpenAi,
        api_key: "sk-upstream".to_string(),
        base_url: Some("https://llm.internal/v1".to_string()),
        user_id: Some(user.to_string()),
    }
}

#[tokio::test]
async fn virtual_key_resolves_to_parent_credential() {
    for (name, storage) in backends().await {
        let parent = storage.create_chat_api_key(openai_key("alice")).await.unwrap();
        let created = storage
            .create_virtual_key(parent.id, "ci", None)
            .await
            .unwrap();
        assert!(created.token.starts_with(VIRTUAL_KEY_PREFIX), "{name}");
        assert!(created.key.last_used_at.is_none());

        let resolved = storage
            .validate_virtual_key(&created.token, ProviderKind::OpenAi)
            .await
            .unwrap();
        assert_eq!(resolved.api_key, "sk-upstream", "{name}");
        assert_eq!(resolved.base_url.as_deref(), Some("https://llm.internal/v1"));
        assert_eq!(resolved.virtual_key_id, created.key.id);

        let (key, _) = storage
            .lookup_virtual_key(&warden_storage::virtual_key::hash_token(&created.token))
            .await
            .unwrap()
            .unwrap();
        assert!(key.last_used_at.is_some(), "{name}: last_used_at not recorded");
    }
}

#[tokio::test]
async fn provider_mismatch_is_a_bad_request() {
    for (name, storage) in backends().await {
        let parent = storage.create_chat_api_key(openai_key("bob")).await.unwrap();
        let created = storage
            .create_virtual_key(parent.id, "ci", None)
            .await
            .unwrap();
        let err = storage
            .validate_virtual_key(&created.token, ProviderKind::Anthropic)
            .await
            .unwrap_err();
        match err {
            VirtualKeyError::BadRequest(message) => {
                assert!(message.contains("openai"), "{name}: {message}");
                assert!(message.contains("anthropic"), "{name}: {message}");
            }
            other => panic!("{name}: unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn expired_and_unknown_keys_are_unauthorized() {
    for (name, storage) in backends().await {
        let parent = storage.create_chat_api_key(openai_key("carol")).await.unwrap();
        let expired = storage
            .create_virtual_key(
                parent.id,
                "old",
                Some(OffsetDateTime::now_utc() - Duration::minutes(1)),
            )
            .await
            .unwrap();
        assert!(matches!(
            storage
                .validate_virtual_key(&expired.token, ProviderKind::OpenAi)
                .await,
            Err(VirtualKeyError::Unauthorized(_))
        ), "{name}");
        assert!(matches!(
            storage
                .validate_virtual_key("wvk_doesnotexist", ProviderKind::OpenAi)
                .await,
            Err(VirtualKeyError::Unauthorized(_))
        ), "{name}");
    }
}

#[tokio::test]
async fn deleting_parent_revokes_virtual_keys() {
    for (name, storage) in backends().await {
        let parent = storage.create_chat_api_key(openai_key("dave")).await.unwrap();
        let created = storage
            .create_virtual_key(parent.id, "ci", None)
            .await
            .unwrap();
        assert!(storage.delete_chat_api_key(parent.id).await.unwrap(), "{name}");
        assert!(matches!(
            storage
                .validate_virtual_key(&created.token, ProviderKind::OpenAi)
                .await,
            Err(VirtualKeyError::Unauthorized(_))
        ), "{name}");
        assert!(!storage.delete_virtual_key(created.key.id).await.unwrap(), "{name}");
    }
}

#[tokio::test]
async fn chat_key_lookup_is_per_user_and_provider() {
    for (name, storage) in backends().await {
        let user = format!("erin-{name}");
        storage.create_chat_api_key(openai_key(&user)).await.unwrap();
        let found = storage
            .find_chat_api_key_for_user(&user, ProviderKind::OpenAi)
            .await
            .unwrap();
        assert!(found.is_some(), "{name}");
        assert!(
            storage
                .find_chat_api_key_for_user(&user, ProviderKind::Anthropic)
                .await
                .unwrap()
                .is_none(),
            "{name}"
        );
    }
}
