//! flowgate server - standalone entry point
//!
//! Thin wrapper around `flowgate-api`: tracing, configuration from the
//! environment, then serve until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use flowgate_api::telemetry::{init_tracing, TelemetryConfig};
use flowgate_api::{FlowgateServer, GatewayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::from_env();
    init_tracing(&telemetry);

    let config = GatewayConfig::from_env().context("invalid flowgate configuration")?;

    tracing::info!(
        service = %telemetry.service_name,
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.addr,
        environment = config.environment.as_str(),
        webhook_url = %config.webhook.base_url,
        in_memory_queue = config.queue.uses_memory_backend(),
        "Starting flowgate"
    );

    let server = FlowgateServer::new(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize server");
        e
    })?;

    server.run().await.map_err(|e| {
        tracing::error!(error = %e, "Server error during execution");
        e
    })?;

    Ok(())
}
