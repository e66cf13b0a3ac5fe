#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{ to_bytes, Body };
use axum::http::{ header, Request, Response };
use axum::Router;
use serde_json::Value;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::{ Arc, Mutex };
use tower::ServiceExt;
use vision_chat::config::prompt::Persona;
use vision_chat::gateway::ConversationGateway;
use vision_chat::history::MemoryHistoryStore;
use vision_chat::llm::chat::{ FragmentStream, GenerationEngine };
use vision_chat::llm::{ EngineError, GenerationParams, LlmType };
use vision_chat::models::chat::Message;
use vision_chat::server::api::{ router, AppState };

pub enum Behavior {
    Reply(Vec<&'static str>),
    Fail(&'static str),
    FailMidStream(Vec<&'static str>, &'static str),
}

pub struct MockEngine {
    behavior: Behavior,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

impl MockEngine {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<Message> {
        self.last_messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationEngine for MockEngine {
    async fn generate_stream(
        &self,
        messages: &[Message],
        _params: &GenerationParams
    ) -> Result<FragmentStream, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages.to_vec();

        let items: Vec<Result<String, EngineError>> = match &self.behavior {
            Behavior::Reply(parts) => parts.iter().map(|p| Ok(p.to_string())).collect(),
            Behavior::Fail(reason) => {
                return Err(EngineError::Other(reason.to_string()));
            }
            Behavior::FailMidStream(parts, reason) => {
                let mut items: Vec<Result<String, EngineError>> = parts
                    .iter()
                    .map(|p| Ok(p.to_string()))
                    .collect();
                items.push(Err(EngineError::Other(reason.to_string())));
                items
            }
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn model(&self) -> String {
        "mock-qwen".into()
    }

    fn llm_type(&self) -> LlmType {
        LlmType::LlamaCpp
    }
}

pub fn app_with(engine: Option<Arc<MockEngine>>, persist_streamed: bool) -> Router {
    let engine = engine.map(|e| e as Arc<dyn GenerationEngine>);
    let gateway = ConversationGateway::new(
        engine,
        Arc::new(MemoryHistoryStore::new()),
        Arc::new(Persona::default())
    ).with_streamed_reply_persistence(persist_streamed);
    router(AppState::new(Arc::new(gateway)), "static")
}

pub fn app(engine: Option<Arc<MockEngine>>) -> Router {
    app_with(engine, false)
}

pub async fn send(app: &Router, req: Request<Body>) -> (u16, String) {
    let resp: Response<Body> = app.clone().oneshot(req).await.unwrap();
    let status = resp.status().as_u16();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> (u16, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, text) = send(app, req).await;
    (status, serde_json::from_str(&text).unwrap_or(Value::Null))
}

pub async fn get(app: &Router, uri: &str) -> (u16, String) {
    let req = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    send(app, req).await
}

pub async fn get_json(app: &Router, uri: &str) -> (u16, Value) {
    let (status, text) = get(app, uri).await;
    (status, serde_json::from_str(&text).unwrap_or(Value::Null))
}

/// Data payloads of an SSE body, one entry per event.
pub fn sse_events(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| {
            let data: Vec<&str> = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            if data.is_empty() {
                None
            } else {
                Some(data.join("\n"))
            }
        })
        .collect()
}

pub async fn history_len(app: &Router, conversation_id: Option<&str>) -> usize {
    let uri = match conversation_id {
        Some(id) => format!("/history?conversation_id={}", id),
        None => "/history".to_string(),
    };
    let (status, body) = get_json(app, &uri).await;
    assert_eq!(status, 200);
    body["messages"].as_array().map(|m| m.len()).unwrap_or(0)
}
