use std::collections::HashMap;
use std::sync::Arc;

use warden_common::ProviderKind;

use crate::LlmProvider;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Resolves the `{provider}` path segment of an inbound route.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        ProviderKind::parse(name).and_then(|kind| self.get(kind))
    }

    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.providers.keys().copied()
    }
}
