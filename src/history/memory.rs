use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use crate::history::{ HistoryError, HistoryStore };
use crate::models::chat::Message;

/// Process-local history; lives as long as the server.
#[derive(Default)]
pub struct MemoryHistoryStore {
    conversations: Mutex<HashMap<String, Vec<Message>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), HistoryError> {
        let mut conversations = self.conversations.lock().await;
        conversations.entry(conversation_id.to_string()).or_default().push(message);
        Ok(())
    }

    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>, HistoryError> {
        let conversations = self.conversations.lock().await;
        Ok(conversations.get(conversation_id).cloned().unwrap_or_default())
    }
}
