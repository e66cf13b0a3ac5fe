use async_trait::async_trait;
use crate::models::chat::{ Message, Role };
use crate::history::{ HistoryError, HistoryStore };
use chrono::Utc;
use log::error;
use redis::{ Client, AsyncCommands };
use serde::{ Serialize, Deserialize };

#[derive(Serialize, Deserialize)]
struct StoredMessage {
    role: Role,
    content: String,
    timestamp: i64,
}

/// One Redis list per conversation, oldest turn first.
pub struct RedisHistoryStore {
    client: Client,
    key_prefix: String,
}

impl RedisHistoryStore {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self, HistoryError> {
        Ok(Self {
            client: Client::open(url)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, conversation_id: &str) -> String {
        format!("{}{}", self.key_prefix, conversation_id)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

// A corrupt entry fails the whole load rather than dropping a turn.
fn decode_entries(conversation_id: &str, json_entries: &[String]) -> Result<Vec<Message>, HistoryError> {
    json_entries
        .iter()
        .map(|json_entry| {
            serde_json::from_str::<StoredMessage>(json_entry)
                .map(|msg| Message::new(msg.role, msg.content))
                .map_err(|e| {
                    error!("Error parsing history entry of '{}': {}", conversation_id, e);
                    HistoryError::from(e)
                })
        })
        .collect()
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), HistoryError> {
        let mut conn = self.get_connection().await?;

        let stored = StoredMessage {
            role: message.role,
            content: message.content,
            timestamp: Utc::now().timestamp(),
        };

        let json_msg = serde_json::to_string(&stored)?;
        let _: i64 = conn.rpush(self.key(conversation_id), &json_msg).await?;
        Ok(())
    }

    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>, HistoryError> {
        let mut conn = self.get_connection().await?;
        let json_entries: Vec<String> = conn.lrange(self.key(conversation_id), 0, -1).await?;
        decode_entries(conversation_id, &json_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_prefix() {
        let store = RedisHistoryStore::new("redis://127.0.0.1:6379", "history:").unwrap();
        assert_eq!(store.key("default"), "history:default");
    }

    #[test]
    fn entries_decode_in_order() {
        let entries = vec![
            r#"{"role":"user","content":"ciao","timestamp":1}"#.to_string(),
            r#"{"role":"assistant","content":"ciao!","timestamp":2}"#.to_string(),
        ];
        let messages = decode_entries("default", &entries).unwrap();
        assert_eq!(messages, vec![Message::user("ciao"), Message::assistant("ciao!")]);
    }

    #[test]
    fn corrupt_entry_fails_the_load() {
        let entries = vec![
            r#"{"role":"user","content":"ciao","timestamp":1}"#.to_string(),
            "not json".to_string(),
        ];
        let err = decode_entries("default", &entries).unwrap_err();
        assert!(matches!(err, HistoryError::Serde(_)));
    }

    #[test]
    fn stored_message_round_trips_role() {
        let json = r#"{"role":"assistant","content":"ciao","timestamp":1}"#;
        let stored: StoredMessage = serde_json::from_str(json).unwrap();
        assert_eq!(stored.role, Role::Assistant);
    }
}
