use log::{ info, warn };
use reqwest::Url;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{ Child, Command };
use tokio::time::{ sleep, Instant };

use super::chat::GenerationEngine;
use super::EngineError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LlamaServerConfig {
    pub binary: PathBuf,
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub ctx_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
}

impl LlamaServerConfig {
    /// Derives listen host and port from the URL the gateway will call.
    pub fn for_engine_url(
        binary: PathBuf,
        model_path: PathBuf,
        engine_url: &str,
        ctx_size: u32,
        threads: u32,
        gpu_layers: u32
    ) -> Result<Self, EngineError> {
        let url = Url::parse(engine_url).map_err(|e|
            EngineError::Other(format!("Invalid engine URL '{}': {}", engine_url, e))
        )?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Other(format!("Engine URL '{}' has no host", engine_url)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| EngineError::Other(format!("Engine URL '{}' has no port", engine_url)))?;

        Ok(Self { binary, model_path, host, port, ctx_size, threads, gpu_layers })
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "--model".into(),
            self.model_path.display().to_string(),
            "--host".into(),
            self.host.clone(),
            "--port".into(),
            self.port.to_string(),
            "--ctx-size".into(),
            self.ctx_size.to_string(),
            "--threads".into(),
            self.threads.to_string(),
            "--n-gpu-layers".into(),
            self.gpu_layers.to_string()
        ]
    }
}

/// A `llama-server` child process. Killed when dropped.
pub struct LlamaServerProcess {
    child: Child,
}

impl LlamaServerProcess {
    pub fn spawn(config: &LlamaServerConfig) -> Result<Self, EngineError> {
        info!(
            "Launching {} on {}:{} with model '{}'",
            config.binary.display(),
            config.host,
            config.port,
            config.model_path.display()
        );
        let child = Command::new(&config.binary)
            .args(config.args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e|
                EngineError::Other(format!("Failed to start '{}': {}", config.binary.display(), e))
            )?;
        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Fails if the process already exited.
    pub fn check_running(&mut self) -> Result<(), EngineError> {
        match self.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(EngineError::Other(format!("llama-server exited: {}", status))),
            Err(e) => Err(EngineError::Other(format!("llama-server status unknown: {}", e))),
        }
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to stop llama-server: {}", e);
        }
    }
}

/// Polls the engine until it answers its health check or `timeout` elapses.
pub async fn wait_until_ready(
    engine: &dyn GenerationEngine,
    mut process: Option<&mut LlamaServerProcess>,
    timeout: Duration
) -> Result<(), EngineError> {
    let deadline = Instant::now() + timeout;
    loop {
        let last_error = match engine.health_check().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if let Some(process) = process.as_deref_mut() {
            process.check_running()?;
        }
        if Instant::now() + READY_POLL_INTERVAL > deadline {
            return Err(
                EngineError::NotReady(format!("gave up after {:?}: {}", timeout, last_error))
            );
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::FragmentStream;
    use crate::llm::{ GenerationParams, LlmType };
    use crate::models::chat::Message;
    use async_trait::async_trait;
    use std::sync::atomic::{ AtomicUsize, Ordering };

    struct WarmingEngine {
        calls: AtomicUsize,
        ready_after: usize,
    }

    #[async_trait]
    impl GenerationEngine for WarmingEngine {
        async fn generate_stream(
            &self,
            _messages: &[Message],
            _params: &GenerationParams
        ) -> Result<FragmentStream, EngineError> {
            Err(EngineError::Other("unused".into()))
        }

        async fn health_check(&self) -> Result<(), EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                Ok(())
            } else {
                Err(EngineError::NotReady("loading model".into()))
            }
        }

        fn model(&self) -> String {
            "warming".into()
        }

        fn llm_type(&self) -> LlmType {
            LlmType::LlamaCpp
        }
    }

    #[test]
    fn config_follows_engine_url() {
        let config = LlamaServerConfig::for_engine_url(
            "llama-server".into(),
            "/models/q.gguf".into(),
            "http://127.0.0.1:8081",
            4096,
            8,
            0
        ).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8081);
        let args = config.args();
        let pos = args.iter().position(|a| a == "--ctx-size").unwrap();
        assert_eq!(args[pos + 1], "4096");
        assert!(args.contains(&"/models/q.gguf".to_string()));
    }

    #[test]
    fn rejects_unparseable_engine_url() {
        let err = LlamaServerConfig::for_engine_url(
            "llama-server".into(),
            "m.gguf".into(),
            "not a url",
            4096,
            8,
            0
        );
        assert!(err.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_engine_to_warm_up() {
        let engine = WarmingEngine { calls: AtomicUsize::new(0), ready_after: 3 };
        wait_until_ready(&engine, None, Duration::from_secs(10)).await.unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let engine = WarmingEngine { calls: AtomicUsize::new(0), ready_after: usize::MAX };
        let err = wait_until_ready(&engine, None, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotReady(_)));
    }
}
