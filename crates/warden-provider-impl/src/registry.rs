use std::sync::Arc;

use warden_provider_core::ProviderRegistry;

use crate::{AnthropicProvider, OpenAiProvider};

pub fn build_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(AnthropicProvider::new()));
    registry.register(Arc::new(OpenAiProvider::openai()));
    registry.register(Arc::new(OpenAiProvider::ollama()));
    registry
}
