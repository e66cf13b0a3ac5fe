use crate::cli::Args;
use super::chat::{ llama_cpp, new_client, GenerationEngine };
use super::launcher::{ wait_until_ready, LlamaServerConfig, LlamaServerProcess };
use super::model::{ ensure_model, ModelArtifact };
use super::{ LlmConfig, LlmType };

use log::{ error, info, warn };
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The engine the gateway uses, plus the `llama-server` child backing it, if any.
pub struct EngineHandle {
    engine: Option<Arc<dyn GenerationEngine>>,
    process: Option<LlamaServerProcess>,
}

impl EngineHandle {
    fn unavailable() -> Self {
        Self { engine: None, process: None }
    }

    pub fn engine(&self) -> Option<Arc<dyn GenerationEngine>> {
        self.engine.clone()
    }

    pub async fn shutdown(self) {
        if let Some(process) = self.process {
            info!("Stopping llama-server (pid {:?})", process.id());
            process.shutdown().await;
        }
    }
}

pub fn model_artifact(args: &Args) -> ModelArtifact {
    ModelArtifact {
        dir: PathBuf::from(&args.model_dir),
        repo_id: args.model_repo.clone(),
        file_name: args.model_file.clone(),
        endpoint: args.hf_endpoint.clone(),
    }
}

/// Makes sure the model file is on disk, then brings the engine up.
///
/// A failed download aborts startup. An engine that cannot be started or never turns healthy
/// yields a handle without engine so the server still runs and answers 503.
pub async fn start_engine(args: &Args) -> Result<EngineHandle, Box<dyn Error + Send + Sync>> {
    let llm_type: LlmType = args.engine_type.parse()?;
    let config = LlmConfig {
        llm_type,
        base_url: args.engine_url.clone(),
        model: args.engine_model.clone(),
    };

    let model_path = match llm_type {
        LlmType::LlamaCpp => {
            let artifact = model_artifact(args);
            if args.skip_model_download {
                info!("Model download skipped");
                Some(artifact.local_path())
            } else {
                Some(ensure_model(&artifact).await?)
            }
        }
        LlmType::Ollama => None,
    };

    let engine = new_client(&config);
    info!(
        "Engine configured: Type={}, Model={}, BaseURL={}",
        llm_type,
        engine.model(),
        config.base_url.as_deref().unwrap_or("adapter default")
    );

    let mut process = None;
    if let Some(binary) = &args.llama_server_bin {
        match (&model_path, llm_type) {
            (Some(model_path), LlmType::LlamaCpp) => {
                let engine_url = config.base_url.as_deref().unwrap_or(llama_cpp::DEFAULT_BASE_URL);
                let launch = LlamaServerConfig::for_engine_url(
                    PathBuf::from(binary),
                    model_path.clone(),
                    engine_url,
                    args.ctx_size,
                    args.threads,
                    args.gpu_layers
                ).and_then(|launch| LlamaServerProcess::spawn(&launch));
                match launch {
                    Ok(child) => process = Some(child),
                    Err(e) => {
                        error!("Could not launch llama-server: {}. Chat endpoints will answer 503.", e);
                        return Ok(EngineHandle::unavailable());
                    }
                }
            }
            _ => warn!("--llama-server-bin is ignored for engine type {}", llm_type),
        }
    }

    info!("Loading model into memory... this may take a moment.");
    let timeout = Duration::from_secs(args.engine_ready_timeout);
    match wait_until_ready(engine.as_ref(), process.as_mut(), timeout).await {
        Ok(()) => {
            info!("Model loaded. Ready to chat!");
            Ok(EngineHandle { engine: Some(engine), process })
        }
        Err(e) => {
            error!("Engine unavailable: {}. Chat endpoints will answer 503.", e);
            if let Some(process) = process {
                process.shutdown().await;
            }
            Ok(EngineHandle::unavailable())
        }
    }
}
