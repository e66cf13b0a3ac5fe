mod memory;
mod redis;

pub use memory::MemoryHistoryStore;
pub use self::redis::RedisHistoryStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use thiserror::Error;
use crate::cli::Args;
use crate::models::chat::Message;

pub const DEFAULT_CONVERSATION_ID: &str = "default";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("stored message is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported history store type: {0}")]
    UnsupportedType(String),
}

/// Server-held conversation turns, keyed by conversation id.
///
/// Only user and assistant turns are stored; the system preamble is added by the gateway.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), HistoryError>;

    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>, HistoryError>;
}

pub fn create_history_store(args: &Args) -> Result<Arc<dyn HistoryStore>, HistoryError> {
    match args.history_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryHistoryStore::new())),
        "redis" => {
            let store = RedisHistoryStore::new(&args.history_host, &args.history_redis_prefix)?;
            Ok(Arc::new(store))
        }
        other => Err(HistoryError::UnsupportedType(other.to_string())),
    }
}

pub fn initialize_history_store(args: &Args) -> Result<Arc<dyn HistoryStore>, HistoryError> {
    if args.history_type.eq_ignore_ascii_case("redis") {
        info!("Chat history will be stored in: redis at {}", args.history_host);
    } else {
        info!("Chat history will be stored in: {}", args.history_type);
    }
    create_history_store(args)
}
