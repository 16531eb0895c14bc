use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use relay_core::config::ConfigSnapshot;
use relay_core::{
    QueueSelector, RelayExecutor, RelayState, UpstreamClientConfig, WreqUpstreamClient,
};
use relay_router::RelayService;

mod cli;
mod loader;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    let spec = loader::load_spec(&cli.config)?;
    let snapshot = ConfigSnapshot::from_spec(&spec)?;

    let upstream_config = UpstreamClientConfig {
        connect_timeout: Duration::from_secs(5),
        socket_timeout: Duration::from_millis(snapshot.upstream.socket_timeout_ms),
    };
    let client = Arc::new(WreqUpstreamClient::new(upstream_config)?);

    let state = RelayState::new(snapshot);
    let executor = RelayExecutor::new(client);
    let selector = Arc::new(QueueSelector::from_config(&state.config(), executor)?);

    let app = relay_router::relay_router(RelayService {
        state,
        selector: selector.clone(),
    });

    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(selector))
        .await?;
    Ok(())
}

async fn shutdown_signal(selector: Arc<QueueSelector>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down, draining queues");
    selector.shutdown_all();
}
