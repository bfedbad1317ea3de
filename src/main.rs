use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use flight_insight::{
    config::Config,
    llm::LLM,
    routes::create_router,
    sandbox::ProcessSandbox,
    session::SessionStore,
    store::KnowledgeBase,
    utils, AgentOrchestrator, AppState,
};

#[derive(Parser)]
#[command(name = "flight-insight")]
#[command(version, about = "Ask questions about UAV flight logs in plain language", long_about = None)]
struct Cli {
    /// Port to listen on (overrides PORT).
    #[arg(short, long)]
    port: Option<u16>,

    /// Message knowledge base file (overrides KNOWLEDGE_BASE_PATH).
    #[arg(long)]
    knowledge_base: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::init_tracing();

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(path) = cli.knowledge_base {
        config.store.knowledge_base_path = Some(path);
    }
    info!(
        provider = %config.llm.provider,
        model = %config.llm.model,
        max_sessions = config.sessions.max_sessions,
        "Configuration loaded"
    );

    let knowledge_base = match &config.store.knowledge_base_path {
        Some(path) => Some(Arc::new(KnowledgeBase::load(path)?)),
        None => None,
    };

    let llm = Arc::new(LLM::from_config(&config.llm)?);
    let sandbox = Arc::new(ProcessSandbox::python(&config.sandbox));
    let sessions = Arc::new(SessionStore::new(&config.sessions, &config.store, knowledge_base));
    let orchestrator = Arc::new(AgentOrchestrator::new(&config, llm, sandbox, sessions.clone()));

    // Idle sessions are swept once a minute.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sessions.cleanup_idle_sessions().await;
        }
    });

    let state = AppState {
        config: config.clone(),
        orchestrator,
    };
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
