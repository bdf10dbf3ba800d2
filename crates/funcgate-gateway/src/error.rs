// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for funcgate-gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use funcgate_build::BuildError;
use thiserror::Error;

use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::supervisor::SupervisorError;

/// Gateway errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// No function answers the requested route.
    #[error("No function for route {0}")]
    NotFound(String),

    /// Building the function failed.
    #[error("{0}")]
    Build(#[from] BuildError),

    /// Starting the script runtime failed.
    #[error("{0}")]
    Runtime(#[from] SupervisorError),

    /// Delivering the request to the runtime failed.
    #[error("{0}")]
    Bridge(#[from] BridgeError),

    /// Request body exceeds the configured limit.
    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// Inbound request could not be read.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status reported to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Build(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Build(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Runtime(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Bridge(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Bridge(BridgeError::Native(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Bridge(_) => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_) | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Client errors get the canonical reason; server errors carry the
        // diagnostic so function authors see why their build failed.
        let body = if status.is_server_error() {
            self.to_string()
        } else {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        };
        (status, body).into_response()
    }
}

/// Result type using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
