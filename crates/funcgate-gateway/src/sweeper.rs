// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that evicts idle prepared functions.
//!
//! Prepared functions hold an artifact directory and, for native functions,
//! a loaded library. Entries nobody asked for within the idle TTL are dropped
//! so a long-running gateway does not accumulate builds of every function it
//! ever served.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::registry::FunctionRegistry;

/// Configuration for the idle sweeper.
#[derive(Debug, Clone)]
pub struct IdleSweeperConfig {
    /// How often to look for idle entries.
    pub interval: Duration,
    /// Entries unused for longer than this are evicted.
    pub idle_ttl: Duration,
}

impl Default for IdleSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300), // 5 minutes
            idle_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Background worker that evicts idle registry entries.
pub struct IdleSweeper {
    registry: Arc<FunctionRegistry>,
    config: IdleSweeperConfig,
    shutdown: Arc<Notify>,
}

impl IdleSweeper {
    /// Create a new sweeper over `registry`.
    pub fn new(registry: Arc<FunctionRegistry>, config: IdleSweeperConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_ttl_secs = self.config.idle_ttl.as_secs(),
            "Idle sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Idle sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    self.sweep();
                }
            }
        }

        info!("Idle sweeper stopped");
    }

    /// Evict idle entries once, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let evicted = self.registry.evict_idle(self.config.idle_ttl);
        debug!(evicted, cached = self.registry.len(), "Idle sweep finished");
        evicted
    }
}
