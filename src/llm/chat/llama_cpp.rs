use async_trait::async_trait;
use log::{ debug, info };
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };

use super::{ error_for_status, http_stream_generate, FragmentStream, GenerationEngine, StreamLine };
use crate::llm::{ EngineError, GenerationParams, LlmConfig, LlmType };
use crate::models::chat::Message;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_MODEL: &str = "local";

/// Client for the OpenAI-compatible chat API served by llama.cpp's `llama-server`.
pub struct LlamaCppClient {
    http: HttpClient,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl LlamaCppClient {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Self {
        let url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            http: HttpClient::new(),
            base_url: url.trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.base_url.clone(), config.model.clone())
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn request<'a>(
        &'a self,
        messages: &'a [Message],
        params: &GenerationParams,
        stream: bool
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stream,
        }
    }
}

/// Parses one `data:` line of an OpenAI-style event stream.
pub fn parse_stream_line(line: &str) -> StreamLine {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return StreamLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return StreamLine::Done;
    }

    let value = match serde_json::from_str::<serde_json::Value>(data) {
        Ok(value) => value,
        Err(e) => {
            info!("JSON parse error: {} for data: {}", e, data);
            return StreamLine::Skip;
        }
    };
    if let Some(error) = value.get("error") {
        return StreamLine::Error(error.to_string());
    }

    match serde_json::from_value::<StreamChunk>(value) {
        Ok(chunk) => {
            let mut text = String::new();
            let mut finished = false;
            for choice in chunk.choices {
                if let Some(content) = choice.delta.and_then(|d| d.content) {
                    text.push_str(&content);
                }
                if choice.finish_reason.is_some() {
                    finished = true;
                }
            }
            if text.is_empty() && finished {
                StreamLine::Done
            } else {
                StreamLine::Fragment(text)
            }
        }
        Err(e) => {
            info!("Unexpected stream chunk shape: {}", e);
            StreamLine::Skip
        }
    }
}

#[async_trait]
impl GenerationEngine for LlamaCppClient {
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams
    ) -> Result<String, EngineError> {
        let req = self.request(messages, params, false);
        let resp = self.http.post(self.completions_url()).json(&req).send().await?;
        let body = error_for_status(resp).await?.json::<ChatCompletionResponse>().await?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| EngineError::Decode("no choices in completion response".into()))
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams
    ) -> Result<FragmentStream, EngineError> {
        let req = self.request(messages, params, true);
        debug!("Streaming {} messages to {}", messages.len(), self.completions_url());
        http_stream_generate(&self.http, &self.completions_url(), &req, parse_stream_line).await
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        let resp = self.http.get(format!("{}/health", self.base_url)).send().await?;
        match error_for_status(resp).await {
            Ok(_) => Ok(()),
            Err(EngineError::Status { status: 503, body }) => Err(EngineError::NotReady(body)),
            Err(e) => Err(e),
        }
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn llm_type(&self) -> LlmType {
        LlmType::LlamaCpp
    }
}
