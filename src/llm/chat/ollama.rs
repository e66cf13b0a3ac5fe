use async_trait::async_trait;
use log::info;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };

use super::{ error_for_status, http_stream_generate, FragmentStream, GenerationEngine, StreamLine };
use crate::llm::{ EngineError, GenerationParams, LlmConfig, LlmType };
use crate::models::chat::Message;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "qwen2:0.5b";

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, completion_model: Option<String>) -> Self {
        let model = completion_model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into());

        Self {
            http: HttpClient::new(),
            base_url: url.trim_end_matches('/').to_string(),
            completion_model: model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.base_url.clone(), config.model.clone())
    }

    fn request<'a>(
        &'a self,
        messages: &'a [Message],
        params: &GenerationParams,
        stream: bool
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.completion_model,
            messages,
            stream,
            options: ChatOptions {
                num_predict: params.max_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
            },
        }
    }
}

/// Parses one line of Ollama's newline-delimited JSON stream.
pub fn parse_stream_line(line: &str) -> StreamLine {
    if line.trim().is_empty() {
        return StreamLine::Skip;
    }

    match serde_json::from_str::<ChatResponse>(line) {
        Ok(resp) => {
            if let Some(error) = resp.error {
                return StreamLine::Error(error);
            }
            let content = resp.message.map(|m| m.content).unwrap_or_default();
            if resp.done && content.is_empty() {
                StreamLine::Done
            } else {
                StreamLine::Fragment(content)
            }
        }
        Err(e) => {
            info!("JSON parse error: {} for line: {}", e, line);
            StreamLine::Skip
        }
    }
}

#[async_trait]
impl GenerationEngine for OllamaClient {
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams
    ) -> Result<String, EngineError> {
        let url = format!("{}/api/chat", self.base_url);
        let req = self.request(messages, params, false);
        let resp = self.http.post(&url).json(&req).send().await?;
        let data = error_for_status(resp).await?.json::<ChatResponse>().await?;

        if let Some(error) = data.error {
            return Err(EngineError::Other(error));
        }
        data.message
            .map(|m| m.content)
            .ok_or_else(|| EngineError::Decode("missing message in chat response".into()))
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams
    ) -> Result<FragmentStream, EngineError> {
        let url = format!("{}/api/chat", self.base_url);
        let req = self.request(messages, params, true);
        http_stream_generate(&self.http, &url, &req, parse_stream_line).await
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        let resp = self.http.get(format!("{}/api/tags", self.base_url)).send().await?;
        error_for_status(resp).await?;
        Ok(())
    }

    fn model(&self) -> String {
        self.completion_model.clone()
    }

    fn llm_type(&self) -> LlmType {
        LlmType::Ollama
    }
}
