use crate::config::prompt::Persona;
use crate::history::{ HistoryError, HistoryStore };
use crate::llm::chat::GenerationEngine;
use crate::llm::{ EngineError, GenerationParams };
use crate::models::chat::{ Conversation, Message, Role };

use futures::{ Stream, StreamExt };
use log::{ debug, error, info, warn };
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Sentinel data of the last event of every streamed reply.
pub const END_MARKER: &str = "[END]";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing message")]
    EmptyMessage,
    #[error("Invalid history: {0}")]
    InvalidHistory(String),
    #[error("The language model is not available")]
    EngineUnavailable,
    #[error("{0}")]
    Generation(#[from] EngineError),
    #[error("{0}")]
    History(#[from] HistoryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Error(String),
    End,
}

impl StreamEvent {
    /// Text carried by the event on the wire.
    pub fn into_data(self) -> String {
        match self {
            StreamEvent::Fragment(text) => text,
            StreamEvent::Error(message) => format!("[Error: {}]", message),
            StreamEvent::End => END_MARKER.to_string(),
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

fn request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

// A system message may only lead the history.
fn check_history(history: &[Message]) -> Result<(), GatewayError> {
    match history.iter().skip(1).position(|m| m.role == Role::System) {
        Some(pos) => {
            warn!("Rejected history with a system message at position {}", pos + 1);
            Err(GatewayError::InvalidHistory(format!("system message at position {}", pos + 1)))
        }
        None => Ok(()),
    }
}

/// Forwards user turns plus the conversation so far to the generation engine.
///
/// `engine` is `None` when the model could not be brought up at startup; every exchange then
/// fails with [`GatewayError::EngineUnavailable`] before touching any history.
pub struct ConversationGateway {
    engine: Option<Arc<dyn GenerationEngine>>,
    history: Arc<dyn HistoryStore>,
    persona: Arc<Persona>,
    params: GenerationParams,
    persist_streamed_replies: bool,
}

impl ConversationGateway {
    pub fn new(
        engine: Option<Arc<dyn GenerationEngine>>,
        history: Arc<dyn HistoryStore>,
        persona: Arc<Persona>
    ) -> Self {
        Self {
            engine,
            history,
            persona,
            params: GenerationParams::default(),
            persist_streamed_replies: false,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_streamed_reply_persistence(mut self, enabled: bool) -> Self {
        self.persist_streamed_replies = enabled;
        self
    }

    pub fn engine_available(&self) -> bool {
        self.engine.is_some()
    }

    pub fn model(&self) -> Option<String> {
        self.engine.as_ref().map(|engine| engine.model())
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    // Engine availability is checked before the message itself.
    fn prepare<'m>(
        &self,
        message: &'m str
    ) -> Result<(Arc<dyn GenerationEngine>, &'m str), GatewayError> {
        let engine = self.engine.clone().ok_or(GatewayError::EngineUnavailable)?;
        let text = message.trim();
        if text.is_empty() {
            return Err(GatewayError::EmptyMessage);
        }
        Ok((engine, text))
    }

    /// The server-held conversation, system preamble first.
    pub async fn conversation(&self, conversation_id: &str) -> Result<Conversation, GatewayError> {
        let turns = self.history.load(conversation_id).await?;
        Ok(Conversation::from_history(&self.persona.system_prompt, turns))
    }

    /// One complete exchange on a server-held conversation.
    ///
    /// The user turn is stored before generation and stays stored if generation fails.
    pub async fn complete(
        &self,
        conversation_id: &str,
        message: &str
    ) -> Result<String, GatewayError> {
        let (engine, text) = self.prepare(message)?;
        let rid = request_id();

        self.history.append(conversation_id, Message::user(text)).await?;
        let conversation = self.conversation(conversation_id).await?;
        info!(
            "[{}] conversation '{}': generating reply over {} messages",
            rid,
            conversation_id,
            conversation.len()
        );

        let reply = engine.generate(conversation.messages(), &self.params).await.map_err(|e| {
            error!("[{}] generation failed: {}", rid, e);
            e
        })?;

        self.history.append(conversation_id, Message::assistant(reply.clone())).await?;
        debug!("[{}] reply of {} chars stored", rid, reply.len());
        Ok(reply)
    }

    /// One complete exchange over caller-supplied history; nothing is kept server-side.
    pub async fn complete_stateless(
        &self,
        message: &str,
        history: Option<Vec<Message>>
    ) -> Result<(String, Vec<Message>), GatewayError> {
        let (engine, text) = self.prepare(message)?;
        let history = history.unwrap_or_default();
        check_history(&history)?;
        let rid = request_id();

        let mut conversation = Conversation::from_history(&self.persona.system_prompt, history);
        conversation.push_user(text);
        info!("[{}] stateless exchange over {} messages", rid, conversation.len());

        let reply = engine.generate(conversation.messages(), &self.params).await.map_err(|e| {
            error!("[{}] generation failed: {}", rid, e);
            e
        })?;

        conversation.push_assistant(reply.clone());
        Ok((reply, conversation.into_messages()))
    }

    /// Streams the reply to a new user turn as fragments, always finishing with
    /// [`StreamEvent::End`].
    ///
    /// Failures once streaming has started become a single [`StreamEvent::Error`] right before
    /// the end marker. The reply is only stored when streamed reply persistence is enabled.
    pub async fn stream(
        &self,
        conversation_id: &str,
        message: &str
    ) -> Result<EventStream, GatewayError> {
        let (engine, text) = self.prepare(message)?;
        let rid = request_id();

        self.history.append(conversation_id, Message::user(text)).await?;
        let conversation = self.conversation(conversation_id).await?;
        info!(
            "[{}] conversation '{}': streaming reply over {} messages",
            rid,
            conversation_id,
            conversation.len()
        );

        let params = self.params;
        let history = Arc::clone(&self.history);
        let persist = self.persist_streamed_replies;
        let conversation_id = conversation_id.to_string();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut reply = String::new();
            let failure = match engine.generate_stream(conversation.messages(), &params).await {
                Ok(mut fragments) => {
                    let mut failure = None;
                    while let Some(item) = fragments.next().await {
                        match item {
                            Ok(fragment) if fragment.is_empty() => {}
                            Ok(fragment) => {
                                reply.push_str(&fragment);
                                if tx.send(StreamEvent::Fragment(fragment)).await.is_err() {
                                    debug!("[{}] client disconnected mid-stream", rid);
                                    return;
                                }
                            }
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    failure
                }
                Err(e) => Some(e),
            };

            match failure {
                Some(e) => {
                    error!("[{}] streaming failed: {}", rid, e);
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                }
                None if persist => {
                    if let Err(e) = history.append(&conversation_id, Message::assistant(reply)).await {
                        warn!("[{}] could not store streamed reply: {}", rid, e);
                    }
                }
                None => debug!("[{}] streamed {} chars", rid, reply.len()),
            }

            let _ = tx.send(StreamEvent::End).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
