pub mod agent_limits;
pub mod agent_policies;
pub mod agents;
pub mod chat_api_keys;
pub mod identity_providers;
pub mod interactions;
pub mod model_pricing;
pub mod optimization_rules;
pub mod virtual_keys;

pub use agent_limits::Entity as AgentLimits;
pub use agent_policies::Entity as AgentPolicies;
pub use agents::Entity as Agents;
pub use chat_api_keys::Entity as ChatApiKeys;
pub use identity_providers::Entity as IdentityProviders;
pub use interactions::Entity as Interactions;
pub use model_pricing::Entity as ModelPricing;
pub use optimization_rules::Entity as OptimizationRules;
pub use virtual_keys::Entity as VirtualKeys;
