pub mod cli;
pub mod config;
pub mod gateway;
pub mod history;
pub mod llm;
pub mod models;
pub mod server;

use cli::Args;
use config::prompt::load_persona;
use gateway::ConversationGateway;
use history::initialize_history_store;
use llm::bootstrap::start_engine;
use llm::GenerationParams;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.listen_addr());
    info!("Engine Type: {}", args.engine_type);
    info!("Engine URL: {}", args.engine_url.as_deref().unwrap_or("adapter default"));
    info!("Model: {}/{} in '{}'", args.model_repo, args.model_file, args.model_dir);
    info!(
        "Generation: max_tokens={}, temperature={}, top_p={}",
        args.max_tokens,
        args.temperature,
        args.top_p
    );
    info!("History Store Type: {}", args.history_type);
    info!("Persist Streamed Replies: {}", args.persist_streamed_replies);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let persona = load_persona(args.persona_path.as_deref())?;
    let history = initialize_history_store(&args)?;
    let engine = start_engine(&args).await?;

    let params = GenerationParams {
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        top_p: args.top_p,
    };
    let gateway = ConversationGateway::new(engine.engine(), history, persona)
        .with_params(params)
        .with_streamed_reply_persistence(args.persist_streamed_replies);

    let addr = args.listen_addr();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, Arc::new(gateway), args.clone());
    let result = server.run().await;

    engine.shutdown().await;
    result
}
