use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use warden_core::{ProxyEngine, UpstreamClientConfig, WreqUpstreamClient};
use warden_provider_core::{EventHub, TerminalEventSink};

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("warden failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Cli::parse()
        .into_patch()
        .into_config()
        .context("invalid configuration")?;
    info!(
        host = %config.host,
        port = config.port,
        tool_policy = ?config.tool_policy,
        toon_compression = config.toon_compression,
        dual_llm_model = %config.dual_llm.model,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        "config loaded"
    );

    let storage = warden_storage::open(&config.dsn)
        .await
        .context("failed to open storage")?;
    info!("storage ready");

    let client = WreqUpstreamClient::new(UpstreamClientConfig::from_global(&config))
        .context("failed to build upstream client")?;

    let events = EventHub::default();
    if config.event_log {
        events
            .add_sink(Arc::new(TerminalEventSink::new(
                config.event_redact_sensitive,
            )))
            .await;
    }

    let bind = format!("{}:{}", config.host, config.port);
    let engine = Arc::new(ProxyEngine::new(
        config,
        storage,
        Arc::new(client),
        events,
    ));
    let app = warden_router::proxy_router(engine.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %bind, "listening");

    let shutdown_engine = engine.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutting down");
        shutdown_engine.shutdown();
    })
    .await
    .context("server error")?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warden=info,sea_orm=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
