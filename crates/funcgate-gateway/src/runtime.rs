// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for funcgate-gateway.
//!
//! [`GatewayRuntime`] runs the HTTP gateway and the idle sweeper inside an
//! existing tokio application. The standalone `funcgate` binary is a thin
//! wrapper around it.
//!
//! ```rust,ignore
//! use funcgate_gateway::config::GatewayConfig;
//! use funcgate_gateway::runtime::GatewayRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = GatewayRuntime::builder()
//!         .config(GatewayConfig::for_working_dir("./my-project"))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::env::{AttachedEnvironment, DetachedEnvironment, StaticEnvironment};
use crate::scratch::ScratchDir;
use crate::server::{GatewayState, router};
use crate::sweeper::{IdleSweeper, IdleSweeperConfig};

/// Builder for creating a [`GatewayRuntime`].
#[derive(Default)]
pub struct GatewayRuntimeBuilder {
    config: Option<GatewayConfig>,
    attached: Option<Arc<dyn AttachedEnvironment>>,
    scratch_parent: Option<PathBuf>,
}

impl GatewayRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gateway configuration (required).
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the attached execution environment.
    ///
    /// Default: built from [`GatewayConfig::runtime_vars`]; detached when empty.
    pub fn attached_environment(mut self, attached: Arc<dyn AttachedEnvironment>) -> Self {
        self.attached = Some(attached);
        self
    }

    /// Create the scratch directory under `parent` instead of the system temp dir.
    pub fn scratch_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.scratch_parent = Some(parent.into());
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<GatewayRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;

        let attached = self.attached.unwrap_or_else(|| {
            if config.runtime_vars.is_empty() {
                Arc::new(DetachedEnvironment)
            } else {
                Arc::new(StaticEnvironment::new(config.runtime_vars.clone()))
            }
        });

        Ok(GatewayRuntimeConfig {
            config,
            attached,
            scratch_parent: self.scratch_parent,
        })
    }
}

/// Configuration for a [`GatewayRuntime`].
pub struct GatewayRuntimeConfig {
    config: GatewayConfig,
    attached: Arc<dyn AttachedEnvironment>,
    scratch_parent: Option<PathBuf>,
}

impl GatewayRuntimeConfig {
    /// Start the runtime, spawning the HTTP server and idle sweeper tasks.
    pub async fn start(self) -> Result<GatewayRuntime> {
        let scratch = Arc::new(match &self.scratch_parent {
            Some(parent) => ScratchDir::new_in(parent)?,
            None => ScratchDir::new()?,
        });

        let state = Arc::new(GatewayState::new(
            &self.config,
            Arc::clone(&scratch),
            self.attached,
        )?);

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        // Create idle sweeper
        let sweeper = IdleSweeper::new(
            Arc::clone(state.registry()),
            IdleSweeperConfig {
                interval: self.config.sweep_interval,
                idle_ttl: self.config.idle_ttl,
            },
        );
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        // Start HTTP server task
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_server_with_shutdown(
            listener,
            router(Arc::clone(&state)),
            server_shutdown_rx,
        ));

        info!(
            addr = %local_addr,
            functions_dir = %self.config.functions_dir.display(),
            handle_prefix = %state.handle_prefix(),
            scratch_dir = %scratch.path().display(),
            "GatewayRuntime started"
        );

        Ok(GatewayRuntime {
            server_handle,
            sweeper_handle,
            server_shutdown_tx,
            sweeper_shutdown,
            shutdown_grace: self.config.shutdown_grace,
            state,
            scratch,
            local_addr,
        })
    }
}

/// A running gateway that can be embedded in an application.
///
/// The runtime manages:
/// - HTTP server dispatching requests to functions
/// - Idle sweeper evicting unused prepared functions
/// - Scratch directory holding artifacts and bootstrap files
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GatewayRuntime {
    server_handle: JoinHandle<Result<()>>,
    sweeper_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    sweeper_shutdown: Arc<Notify>,
    shutdown_grace: Duration,
    state: Arc<GatewayState>,
    scratch: Arc<ScratchDir>,
    local_addr: SocketAddr,
}

impl GatewayRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> GatewayRuntimeBuilder {
        GatewayRuntimeBuilder::new()
    }

    /// Address the HTTP server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Scratch directory for this runtime.
    pub fn scratch(&self) -> &Arc<ScratchDir> {
        &self.scratch
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting requests and the sweeper, then waits for in-flight
    /// requests for at most [`GatewayConfig::shutdown_grace`]. Connections
    /// still open after that are abandoned. Every prepared function is
    /// dropped and the scratch directory removed either way.
    pub async fn shutdown(self) -> Result<()> {
        info!("GatewayRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.sweeper_handle.await {
            error!("Idle sweeper task panicked: {}", e);
        }

        let mut server_handle = self.server_handle;
        let server_result = match tokio::time::timeout(self.shutdown_grace, &mut server_handle).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("Gateway server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
            Err(_) => {
                warn!(
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "In-flight requests did not finish within the shutdown grace period, abandoning them"
                );
                server_handle.abort();
                let _ = server_handle.await;
                Ok(())
            }
        };

        let cleared = self.state.registry().clear();
        if self.state.registry().len() > 0 {
            warn!(
                remaining = self.state.registry().len(),
                "Prepared functions still in use at shutdown"
            );
        }
        self.scratch.remove()?;

        match server_result {
            Ok(()) => {
                info!(cleared, "GatewayRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Gateway server error during shutdown: {}", e);
                Err(e)
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.sweeper_handle.is_finished()
    }
}

/// Serve `app` until the shutdown flag is raised.
async fn run_server_with_shutdown(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
            info!("Gateway server received shutdown signal");
        })
        .await?;
    Ok(())
}
