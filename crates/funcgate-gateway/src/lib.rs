// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! funcgate Gateway - Request-Triggered Function Execution
//!
//! An HTTP front door that answers each request by running the function file
//! whose path matches the URL. Functions are built on first use, rebuilt when
//! their source changes, and executed either in a short-lived runtime process
//! (scripts) or in-process as a loaded shared library (native modules).
//!
//! # Architecture
//!
//! ```text
//!                         HTTP request
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    funcgate-gateway (This Crate)                         │
//! │                                                                          │
//! │  strip prefix ──► Resolver ──► FunctionRegistry ──► build if stale      │
//! │                  (funcgate-build)   (one build per path)                 │
//! │                                          │                               │
//! │                    ┌─────────────────────┴───────────────────┐          │
//! │                    ▼                                         ▼          │
//! │          RuntimeSupervisor                          NativeModule        │
//! │     bootstrap + runtime process              (blocking pool call)      │
//! │                    │                                         │          │
//! │                    ▼                                         │          │
//! │            RequestBridge ── loopback HTTP, retry ──┐         │          │
//! │                                                    ▼         ▼          │
//! │                                               relay response            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Scratch directory: <base>/<stem>-XXXXXX/ artifacts, bootstrap files    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Request outcomes
//!
//! | Situation | Status |
//! |-----------|--------|
//! | No function for the path, or no build strategy for it | 404 |
//! | Build failed | 500 |
//! | Build, readiness, or upstream deadline elapsed | 504 |
//! | Runtime failed to start | 500 |
//! | Runtime transport error | 502 |
//! | Body larger than `FUNCGATE_MAX_BODY_BYTES` | 413 |
//!
//! # Configuration
//!
//! See [`config::GatewayConfig::from_env`] for the `FUNCGATE_*` variables.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod env;
pub mod error;
pub mod preflight;
pub mod registry;
pub mod runtime;
pub mod scratch;
pub mod server;
pub mod supervisor;
pub mod sweeper;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use runtime::GatewayRuntime;
