pub mod llama_cpp;
pub mod ollama;

use async_trait::async_trait;
use futures::{ Stream, StreamExt, Future };
use log::{ debug, warn };
use reqwest::Client as HttpClient;
use std::pin::Pin;
use std::sync::Arc;
use super::{ EngineError, GenerationParams, LlmConfig, LlmType };
use self::llama_cpp::LlamaCppClient;
use self::ollama::OllamaClient;
use crate::models::chat::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

/// Text generation backend the gateway talks to.
///
/// `generate_stream` yields fragments in generation order and ends when the model is done.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams
    ) -> Result<String, EngineError> {
        collect_fragments(self.generate_stream(messages, params).await?).await
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams
    ) -> Result<FragmentStream, EngineError>;

    async fn health_check(&self) -> Result<(), EngineError>;

    fn model(&self) -> String;

    fn llm_type(&self) -> LlmType;
}

pub async fn collect_fragments(mut stream: FragmentStream) -> Result<String, EngineError> {
    let mut reply = String::new();
    while let Some(fragment) = stream.next().await {
        reply.push_str(&fragment?);
    }
    Ok(reply)
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> FragmentStream
    where
        F: FnOnce(mpsc::Sender<Result<String, EngineError>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

pub fn new_client(config: &LlmConfig) -> Arc<dyn GenerationEngine> {
    match config.llm_type {
        LlmType::LlamaCpp => Arc::new(LlamaCppClient::from_config(config)),
        LlmType::Ollama => Arc::new(OllamaClient::from_config(config)),
    }
}

/// What a single line of a streamed engine response means.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamLine {
    Fragment(String),
    Done,
    Error(String),
    Skip,
}

/// Splits a byte stream into lines, holding back a trailing partial line until the rest of it
/// arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(|c: char| c == '\r' || c == '\n').to_string());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).trim_end_matches('\r').to_string();
        self.pending.clear();
        Some(line)
    }
}

pub async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(EngineError::Status { status: status.as_u16(), body })
}

/// Posts `payload` and turns the line-oriented streaming body into fragments.
///
/// Connection and status failures are returned directly; failures after the body starts
/// arriving are delivered in-band as the last stream item.
pub async fn http_stream_generate(
    http: &HttpClient,
    url: &str,
    payload: &(impl serde::Serialize + Sync),
    line_parser: fn(&str) -> StreamLine
) -> Result<FragmentStream, EngineError> {
    let resp = http.post(url).json(payload).send().await?;
    let resp = error_for_status(resp).await?;

    Ok(
        create_streaming_response(move |tx| async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = LineBuffer::default();

            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(buf) => {
                        for line in buffer.push(&buf) {
                            if !forward_line(&tx, line_parser(&line)).await {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::Http(e))).await;
                        return;
                    }
                }
            }

            if let Some(line) = buffer.finish() {
                forward_line(&tx, line_parser(&line)).await;
            }
        })
    )
}

// Returns false once the stream must stop.
async fn forward_line(tx: &mpsc::Sender<Result<String, EngineError>>, parsed: StreamLine) -> bool {
    match parsed {
        StreamLine::Fragment(text) => {
            if text.is_empty() {
                return true;
            }
            tx.send(Ok(text)).await.is_ok()
        }
        StreamLine::Done => {
            debug!("Engine signalled end of generation");
            false
        }
        StreamLine::Error(message) => {
            warn!("Engine reported an error mid-stream: {}", message);
            let _ = tx.send(Err(EngineError::Other(message))).await;
            false
        }
        StreamLine::Skip => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_joins_lines_split_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert_eq!(buffer.push(b":1}\r\n\r\ndata: [DO"), vec!["data: {\"a\":1}", ""]);
        assert_eq!(buffer.push(b"NE]\n"), vec!["data: [DONE]"]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn line_buffer_flushes_unterminated_tail() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"done\":true}").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("{\"done\":true}"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn line_buffer_keeps_multibyte_characters_split_between_chunks() {
        let text = "perché\n".as_bytes();
        let (head, tail) = text.split_at(6);
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(head).is_empty());
        assert_eq!(buffer.push(tail), vec!["perché"]);
    }

    #[tokio::test]
    async fn collect_fragments_concatenates_in_order() {
        let stream: FragmentStream = Box::pin(
            futures::stream::iter(vec![Ok("Sono ".to_string()), Ok("Vision".to_string())])
        );
        assert_eq!(collect_fragments(stream).await.unwrap(), "Sono Vision");
    }

    #[tokio::test]
    async fn collect_fragments_stops_at_first_error() {
        let stream: FragmentStream = Box::pin(
            futures::stream::iter(
                vec![Ok("partial".to_string()), Err(EngineError::Other("boom".into()))]
            )
        );
        let err = collect_fragments(stream).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn forward_line_skips_empty_fragments_and_stops_on_done() {
        let (tx, mut rx) = mpsc::channel(4);
        assert!(forward_line(&tx, StreamLine::Fragment(String::new())).await);
        assert!(forward_line(&tx, StreamLine::Fragment("x".into())).await);
        assert!(forward_line(&tx, StreamLine::Skip).await);
        assert!(!forward_line(&tx, StreamLine::Done).await);
        drop(tx);
        assert_eq!(rx.recv().await.unwrap().unwrap(), "x");
        assert!(rx.recv().await.is_none());
    }
}
