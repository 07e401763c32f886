use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rag_agent_server::config::Settings;
use rag_agent_server::handlers::build_router;
use rag_agent_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rag_agent_server=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .json(),
        )
        .init();

    info!("🚀 Starting RAG Agent Server...");

    // Load configuration
    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    let state = AppState::from_settings(&settings)?;
    info!(
        "✅ Services ready (remote memory: {}, knowledge base: {})",
        state.has_memory, state.has_knowledge_base
    );

    state.orchestrator.clone().spawn_eviction_sweeper(
        Duration::from_secs(settings.memory.sweep_interval_secs),
        settings.memory.idle_timeout(),
    );

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
