use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the HTTP server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "0.0.0.0:5000")]
    pub server_addr: String,

    /// Port override for hosting platforms that only hand out a port (replaces the SERVER_ADDR port).
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory served under /static (logo and other assets of the test page).
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    pub static_dir: String,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    // --- Engine Args ---
    /// Generation engine type (llama-cpp, ollama)
    #[arg(long, env = "ENGINE_TYPE", default_value = "llama-cpp")]
    pub engine_type: String,

    /// Base URL of the engine API (e.g., http://127.0.0.1:8080 for llama-server, http://localhost:11434 for Ollama)
    #[arg(long, env = "ENGINE_URL")] // No default, let adapters handle defaults if None
    pub engine_url: Option<String>,

    /// Model name sent to the engine (required by Ollama, informational for llama-server)
    #[arg(long, env = "ENGINE_MODEL")]
    pub engine_model: Option<String>,

    /// Seconds to wait for the engine to report healthy at startup.
    #[arg(long, env = "ENGINE_READY_TIMEOUT", default_value = "120")]
    pub engine_ready_timeout: u64,

    // --- Model Artifact Args (llama-cpp only) ---
    /// Local directory holding downloaded model files.
    #[arg(long, env = "MODEL_DIR", default_value = "models")]
    pub model_dir: String,

    /// Hugging Face repository the model file is downloaded from.
    #[arg(long, env = "MODEL_REPO", default_value = "Qwen/Qwen2-0.5B-Instruct-GGUF")]
    pub model_repo: String,

    /// GGUF file name inside the repository.
    #[arg(long, env = "MODEL_FILE", default_value = "qwen2-0_5b-instruct-q4_k_m.gguf")]
    pub model_file: String,

    /// Hugging Face compatible download endpoint.
    #[arg(long, env = "HF_ENDPOINT", default_value = "https://huggingface.co")]
    pub hf_endpoint: String,

    /// Skip the model download (the engine already has its model).
    #[arg(long, env = "SKIP_MODEL_DOWNLOAD", default_value = "false")]
    pub skip_model_download: bool,

    // --- llama-server Launch Args ---
    /// Path to a llama.cpp `llama-server` binary. When set, the server is launched with the downloaded model.
    #[arg(long, env = "LLAMA_SERVER_BIN")]
    pub llama_server_bin: Option<String>,

    /// Context window size passed to llama-server.
    #[arg(long, env = "LLAMA_CTX_SIZE", default_value = "4096")]
    pub ctx_size: u32,

    /// CPU threads used by llama-server.
    #[arg(long, env = "LLAMA_THREADS", default_value = "8")]
    pub threads: u32,

    /// Layers offloaded to the GPU (0 = CPU only).
    #[arg(long, env = "LLAMA_GPU_LAYERS", default_value = "0")]
    pub gpu_layers: u32,

    // --- Generation Args ---
    #[arg(long, env = "MAX_TOKENS", default_value = "512")]
    pub max_tokens: u32,

    #[arg(long, env = "TEMPERATURE", default_value = "0.7")]
    pub temperature: f32,

    #[arg(long, env = "TOP_P", default_value = "0.9")]
    pub top_p: f32,

    /// Also store the assistant reply of streamed exchanges in the conversation history.
    #[arg(long, env = "PERSIST_STREAMED_REPLIES", default_value = "false")]
    pub persist_streamed_replies: bool,

    // --- History Store Args ---
    /// History chat store type (memory, redis)
    #[arg(long, env = "HISTORY_TYPE", default_value = "memory")]
    pub history_type: String,

    /// History chat store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "HISTORY_HOST", default_value = "redis://127.0.0.1:6379")]
    pub history_host: String,

    /// Prefix for Redis history keys.
    #[arg(long, env = "HISTORY_REDIS_PREFIX", default_value = "history:")]
    pub history_redis_prefix: String,

    // --- Persona Args ---
    /// Path to the persona JSON file (system_prompt, assistant_name, greeting). Built-in persona if unset.
    #[arg(long, env = "PERSONA_PATH")]
    pub persona_path: Option<String>,
}

impl Args {
    pub fn listen_addr(&self) -> String {
        match self.port {
            Some(port) => {
                let host = self.server_addr
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(self.server_addr.as_str());
                format!("{}:{}", host, port)
            }
            None => self.server_addr.clone(),
        }
    }
}
