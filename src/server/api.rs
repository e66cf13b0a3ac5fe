use crate::gateway::{ ConversationGateway, EventStream, GatewayError };
use crate::history::DEFAULT_CONVERSATION_ID;
use crate::models::chat::Message;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use axum::{
    routing::{ get, post },
    Router,
    Json,
    extract::{ State, Query, rejection::JsonRejection },
    response::{ Html, IntoResponse, Response, sse::{ Event, KeepAlive, Sse } },
    http::StatusCode,
};
use futures::StreamExt;
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use tower_http::services::ServeDir;
use log::warn;

const INDEX_TEMPLATE: &str = include_str!("../../static/index.html");

#[derive(Deserialize, Default)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct StatelessChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub history: Option<Vec<Message>>,
}

#[derive(Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
}

#[derive(Serialize)]
struct StatelessChatResponse {
    reply: String,
    new_history: Vec<Message>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HistoryResponse {
    conversation_id: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    engine_available: bool,
    model: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<ConversationGateway>,
    index_html: Arc<String>,
}

impl AppState {
    pub fn new(gateway: Arc<ConversationGateway>) -> Self {
        let index_html = render_index(&gateway);
        Self { gateway, index_html: Arc::new(index_html) }
    }
}

fn render_index(gateway: &ConversationGateway) -> String {
    let persona = gateway.persona();
    INDEX_TEMPLATE
        .replace("{{assistant_name}}", &escape_html(&persona.assistant_name))
        .replace("{{greeting}}", &escape_html(&persona.greeting))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn router(state: AppState, static_dir: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/get_response", get(stream_handler).post(response_handler))
        .route("/chat", post(chat_handler))
        .route("/api/chat", post(stateless_chat_handler))
        .route("/history", get(history_handler))
        .route("/health", get(health_handler))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(cors)
        .with_state(state)
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::EmptyMessage | GatewayError::InvalidHistory(_) => StatusCode::BAD_REQUEST,
        GatewayError::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Generation(_) | GatewayError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

fn gateway_error(err: GatewayError) -> Response {
    error_response(status_for(&err), err.to_string())
}

fn rejected(rejection: JsonRejection) -> Response {
    warn!("Rejected chat request body: {}", rejection.body_text());
    error_response(StatusCode::BAD_REQUEST, format!("Invalid request body: {}", rejection.body_text()))
}

// A down engine answers 503 even when the body would be rejected.
fn require_engine(state: &AppState) -> Result<(), GatewayError> {
    if state.gateway.engine_available() {
        Ok(())
    } else {
        Err(GatewayError::EngineUnavailable)
    }
}

fn conversation_id(raw: Option<String>) -> String {
    raw.map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string())
}

// SSE field values may not carry carriage returns; line feeds become extra `data:` lines.
fn sse_data(text: String) -> String {
    if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text
    }
}

fn sse_response(events: EventStream) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let frames = events.map(|event| Ok::<_, Infallible>(Event::default().data(sse_data(event.into_data()))));
    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping")
    )
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(state.index_html.as_ref().clone())
}

async fn stream_handler(State(state): State<AppState>, Query(query): Query<StreamQuery>) -> Response {
    let id = conversation_id(query.conversation_id);
    match state.gateway.stream(&id, &query.message).await {
        Ok(events) => sse_response(events).into_response(),
        Err(e) => {
            warn!("Streaming request refused: {}", e);
            gateway_error(e)
        }
    }
}

async fn response_handler(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>
) -> Response {
    if let Err(e) = require_engine(&state) {
        return (status_for(&e), Json(ChatResponse { response: e.to_string() })).into_response();
    }
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            warn!("Rejected chat request body: {}", rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(ChatResponse { response: rejection.body_text() })).into_response();
        }
    };
    let id = conversation_id(req.conversation_id);

    match state.gateway.complete(&id, &req.message).await {
        Ok(reply) => Json(ChatResponse { response: reply }).into_response(),
        Err(e) => {
            let status = status_for(&e);
            (status, Json(ChatResponse { response: e.to_string() })).into_response()
        }
    }
}

async fn chat_handler(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>
) -> Response {
    if let Err(e) = require_engine(&state) {
        return gateway_error(e);
    }
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return rejected(rejection),
    };
    let id = conversation_id(req.conversation_id);

    match state.gateway.complete(&id, &req.message).await {
        Ok(reply) => Json(ChatResponse { response: reply }).into_response(),
        Err(e) => gateway_error(e),
    }
}

async fn stateless_chat_handler(
    State(state): State<AppState>,
    body: Result<Json<StatelessChatRequest>, JsonRejection>
) -> Response {
    if let Err(e) = require_engine(&state) {
        return gateway_error(e);
    }
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return rejected(rejection),
    };

    match state.gateway.complete_stateless(&req.message, req.history).await {
        Ok((reply, new_history)) => Json(StatelessChatResponse { reply, new_history }).into_response(),
        Err(e) => gateway_error(e),
    }
}

async fn history_handler(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> Response {
    let id = conversation_id(query.conversation_id);
    match state.gateway.conversation(&id).await {
        Ok(conversation) => {
            Json(HistoryResponse {
                conversation_id: id,
                messages: conversation.into_messages(),
            }).into_response()
        }
        Err(e) => gateway_error(e),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine_available = state.gateway.engine_available();
    Json(HealthResponse {
        status: if engine_available { "ok" } else { "degraded" },
        engine_available,
        model: state.gateway.model(),
    })
}
