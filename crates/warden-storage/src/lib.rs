//! Persistence for the proxy's external collaborators: agents, limits, pricing,
//! virtual keys, policies and interaction records.
//!
//! `MemoryStorage` backs tests and `--dsn memory`; `DbStorage` is the SeaORM
//! backend for sqlite, postgres and mysql.

pub mod db;
pub mod entities;
pub mod memory;
pub mod record;
pub mod seaorm;
pub mod storage;
pub mod virtual_key;

pub use memory::MemoryStorage;
pub use record::{InteractionOutcome, InteractionRecord};
pub use seaorm::DbStorage;
pub use storage::{
    AgentDirectory, AgentLimit, ChatApiKey, CreatedVirtualKey, DEFAULT_AGENT_NAME,
    DEFAULT_INPUT_PRICE_PER_MILLION, DEFAULT_OUTPUT_PRICE_PER_MILLION, InteractionStore,
    LimitService, LimitViolation, ModelPricing, NewChatApiKey, PolicyStore, PricingStore,
    ResolvedVirtualKey, Storage, StorageError, StorageResult, UsageDelta, VirtualKey,
    VirtualKeyError, VirtualKeyStore,
};
pub use virtual_key::{VIRTUAL_KEY_PREFIX, is_virtual_key};

use std::sync::Arc;

/// Opens the backend named by `dsn` and syncs its schema.
pub async fn open(dsn: &str) -> StorageResult<Arc<dyn Storage>> {
    if dsn.trim().eq_ignore_ascii_case("memory") {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    let storage = DbStorage::connect(dsn).await?;
    storage.sync().await?;
    Ok(Arc::new(storage))
}
