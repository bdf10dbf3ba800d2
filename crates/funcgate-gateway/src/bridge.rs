// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request bridge: deliver an inbound request to a function runtime and turn
//! its answer into the outbound response.
//!
//! Script runtimes are reached over loopback HTTP. Connection-refused errors
//! are retried at a fixed interval until a deadline, other transport errors
//! fail at once. Native modules are called on the blocking pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use funcgate_build::{NativeModule, NativeRequest, NativeResponse};
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Value used for `Access-Control-Allow-Origin` when the function sets none.
pub const DEFAULT_ALLOW_ORIGIN: &str = "*";

/// Value used for `Access-Control-Allow-Headers` when the function sets none.
pub const DEFAULT_ALLOW_HEADERS: &str = "origin,Accept,Authorization,Content-Type";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Errors from delivering a request to a function runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// The runtime never accepted a connection before the deadline.
    #[error("Function runtime unreachable after {attempts} attempts in {}ms", .elapsed.as_millis())]
    Unreachable {
        /// Connection attempts made.
        attempts: u32,
        /// Time spent retrying.
        elapsed: Duration,
    },

    /// Any other transport failure.
    #[error("Upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// A native handler could not be run to completion.
    #[error("Native function failed: {0}")]
    Native(String),
}

impl BridgeError {
    /// Whether the bridge gave up because of its deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            BridgeError::Unreachable { .. } => true,
            BridgeError::Transport(e) => e.is_timeout(),
            BridgeError::Native(_) => false,
        }
    }
}

/// Retry settings for the loopback client.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Total time allowed for connection attempts.
    pub upstream_timeout: Duration,
    /// Delay between connection attempts.
    pub retry_interval: Duration,
}

/// Inbound request, buffered so it can be re-sent on retry.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// HTTP method.
    pub method: Method,
    /// Path plus optional `?query`.
    pub path_and_query: String,
    /// Inbound headers.
    pub headers: HeaderMap,
    /// Buffered body.
    pub body: Bytes,
}

/// Loopback HTTP client with bounded connection retries.
#[derive(Debug, Clone)]
pub struct RequestBridge {
    client: reqwest::Client,
    config: BridgeConfig,
}

impl RequestBridge {
    /// Create a bridge.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(config.upstream_timeout)
            // Every runtime lives for one request; pooled connections would outlive it.
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(BridgeError::Transport)?;
        Ok(Self { client, config })
    }

    /// Send `request` to the runtime at `base_url`, retrying refused connections.
    pub async fn forward(
        &self,
        base_url: &str,
        request: &ForwardRequest,
    ) -> Result<reqwest::Response, BridgeError> {
        let url = format!("{}{}", base_url, request.path_and_query);
        let headers = forward_headers(&request.headers);
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let result = self
                .client
                .request(request.method.clone(), &url)
                .headers(headers.clone())
                .body(request.body.clone())
                .send()
                .await;

            match result {
                Ok(response) => {
                    debug!(url = %url, attempts, status = %response.status(), "Upstream responded");
                    return Ok(response);
                }
                Err(e) if e.is_connect() => {
                    let elapsed = started.elapsed();
                    if elapsed + self.config.retry_interval > self.config.upstream_timeout {
                        warn!(url = %url, attempts, error = %e, "Giving up on function runtime");
                        return Err(BridgeError::Unreachable { attempts, elapsed });
                    }
                    debug!(url = %url, attempt = attempts, error = %e, "Function runtime not accepting connections; retrying");
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                Err(e) => return Err(BridgeError::Transport(e)),
            }
        }
    }
}

/// Turn an upstream response into the outbound response, streaming the body.
///
/// `guard` is held by the body stream and dropped once the body has been sent
/// or abandoned; pass the runtime that produced the response.
pub fn relay<G>(upstream: reqwest::Response, guard: G) -> Response
where
    G: Send + 'static,
{
    let status = upstream.status();
    let mut headers = HeaderMap::with_capacity(upstream.headers().len() + 2);
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    apply_cors_defaults(&mut headers);

    let body = upstream.bytes_stream().map(move |chunk| {
        let _runtime = &guard;
        chunk
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Run a native handler on the blocking pool.
pub async fn invoke_native(
    module: Arc<NativeModule>,
    request: NativeRequest,
) -> Result<NativeResponse, BridgeError> {
    tokio::task::spawn_blocking(move || module.invoke(&request))
        .await
        .map_err(|e| BridgeError::Native(e.to_string()))
}

/// Turn a native handler's response into the outbound response.
pub fn relay_native(native: NativeResponse) -> Response {
    let status = StatusCode::from_u16(native.status).unwrap_or_else(|_| {
        warn!(status = native.status, "Native function set an invalid status");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut headers = HeaderMap::with_capacity(native.headers.len());
    for (name, value) in native.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) if !is_hop_by_hop(&name) && name != header::CONTENT_LENGTH => {
                headers.append(name, value);
            }
            (Ok(_), Ok(_)) => {}
            _ => warn!(header = %name, "Native function set an invalid header"),
        }
    }

    let mut response = Response::new(Body::from(native.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Inbound headers minus `host`, `content-length`, and hop-by-hop headers.
pub fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if name == header::HOST || name == header::CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Add the default CORS headers that are not already present.
pub fn apply_cors_defaults(headers: &mut HeaderMap) {
    if !headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static(DEFAULT_ALLOW_ORIGIN),
        );
    }
    if !headers.contains_key(header::ACCESS_CONTROL_ALLOW_HEADERS) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(DEFAULT_ALLOW_HEADERS),
        );
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}
