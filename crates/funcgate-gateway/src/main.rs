// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! funcgate - Function Gateway Server
//!
//! Serves every function under the functions directory over HTTP:
//! - Resolves request paths to source files
//! - Builds scripts and native modules on demand
//! - Runs scripts in ephemeral runtimes and proxies the request to them

use tracing::{info, warn};

use funcgate_gateway::config::GatewayConfig;
use funcgate_gateway::preflight;
use funcgate_gateway::runtime::GatewayRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funcgate_gateway=info,funcgate_build=info,funcgate=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = GatewayConfig::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        functions_dir = %config.functions_dir.display(),
        build_dir = %config.build_dir.display(),
        handle_prefix = %config.handle_prefix,
        "Starting funcgate"
    );

    let issues = preflight::run(&config);
    if !issues.is_empty() {
        warn!(count = issues.len(), "Some functions will fail until the issues above are fixed");
    }

    let runtime = GatewayRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Functions serving at http://{}", runtime.local_addr());

    // Wait for shutdown signal
    wait_for_shutdown().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("funcgate shut down");

    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
