// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP front door.
//!
//! Every request under the handle prefix, whatever its method, lands in one
//! fallback handler that resolves, builds, and runs the matching function.

use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use funcgate_build::{
    Artifact, BuildOptions, Builder, BuiltFunction, FunctionDescriptor, NativeModule,
    NativeRequest, Resolver, Toolchain,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::bridge::{self, BridgeConfig, ForwardRequest, RequestBridge};
use crate::config::{GatewayConfig, normalize_prefix};
use crate::env::{AttachedEnvironment, ExecutionEnvironment};
use crate::error::{GatewayError, Result};
use crate::registry::FunctionRegistry;
use crate::scratch::ScratchDir;
use crate::supervisor::{RuntimeSupervisor, SupervisorConfig};

/// Shared state behind the HTTP handler.
pub struct GatewayState {
    resolver: Arc<Resolver>,
    registry: Arc<FunctionRegistry>,
    supervisor: RuntimeSupervisor,
    bridge: RequestBridge,
    env: ExecutionEnvironment,
    handle_prefix: String,
    max_body_bytes: usize,
}

impl GatewayState {
    /// Wire up the pipeline described by `config`, keeping artifacts in `scratch`.
    pub fn new(
        config: &GatewayConfig,
        scratch: Arc<ScratchDir>,
        attached: Arc<dyn AttachedEnvironment>,
    ) -> Result<Self> {
        let resolver = Resolver::with_ignore(&config.functions_dir, config.ignore.iter().cloned());

        let builder = Builder::new(BuildOptions {
            build_dir: config.build_dir.clone(),
            toolchain: Toolchain {
                bundler: config.bundler.clone(),
                rustc: config.rustc.clone(),
                native_opt_level: config.native_opt_level.clone(),
            },
            timeout: config.build_timeout,
        });
        let registry = FunctionRegistry::new(
            builder,
            Arc::clone(&scratch),
            config.max_cached_functions,
        );

        let supervisor = RuntimeSupervisor::new(
            SupervisorConfig {
                runtime: config.script_runtime.clone(),
                ports: config.runtime_ports,
                ready_timeout: config.ready_timeout,
            },
            scratch,
        );

        let bridge = RequestBridge::new(BridgeConfig {
            upstream_timeout: config.upstream_timeout,
            retry_interval: config.retry_interval,
        })?;

        Ok(Self {
            resolver: Arc::new(resolver),
            registry: Arc::new(registry),
            supervisor,
            bridge,
            env: ExecutionEnvironment::new(&config.env_file, attached),
            handle_prefix: normalize_prefix(&config.handle_prefix),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Prepared-function cache.
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Function-variable environment.
    pub fn env(&self) -> &ExecutionEnvironment {
        &self.env
    }

    /// Prefix stripped from request paths before resolution.
    pub fn handle_prefix(&self) -> &str {
        &self.handle_prefix
    }

    /// Run the function answering `uri` and produce its response.
    pub async fn invoke(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        let Some(function_path) = strip_handle_prefix(&self.handle_prefix, uri.path()) else {
            return Err(GatewayError::NotFound(uri.path().to_string()));
        };
        let function_path = function_path.to_string();

        let descriptor = self.resolve(&function_path).await?;
        let function = self.registry.get_or_build(&descriptor).await?;

        match &function.artifact {
            Artifact::Bundle { .. } => {
                let path_and_query = match uri.query() {
                    Some(query) => format!("{}?{}", function_path, query),
                    None => function_path,
                };
                let request = ForwardRequest {
                    method,
                    path_and_query,
                    headers,
                    body,
                };
                self.invoke_script(function, request).await
            }
            Artifact::Native(module) => {
                let request = NativeRequest {
                    method: method.to_string(),
                    path: function_path,
                    query: uri.query().unwrap_or_default().to_string(),
                    headers: native_headers(&headers),
                    body,
                };
                invoke_native(Arc::clone(module), request).await
            }
        }
    }

    async fn resolve(&self, function_path: &str) -> Result<FunctionDescriptor> {
        let resolver = Arc::clone(&self.resolver);
        let path = function_path.to_string();
        let descriptor = tokio::task::spawn_blocking(move || resolver.resolve(&path))
            .await
            .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;

        match descriptor {
            Some(descriptor) if descriptor.kind.is_supported() => Ok(descriptor),
            Some(descriptor) => {
                debug!(
                    route = %descriptor.route,
                    source = %descriptor.source_path.display(),
                    "Function source has no build strategy"
                );
                Err(GatewayError::NotFound(function_path.to_string()))
            }
            None => Err(GatewayError::NotFound(function_path.to_string())),
        }
    }

    async fn invoke_script(
        &self,
        function: Arc<BuiltFunction>,
        request: ForwardRequest,
    ) -> Result<Response> {
        let env = self.env.snapshot().await;
        let runtime = self.supervisor.launch(&function, &env).await?;
        let upstream = self.bridge.forward(&runtime.base_url(), &request).await?;
        // The runtime is stopped and the artifact released once the body is done.
        Ok(bridge::relay(upstream, (runtime, function)))
    }
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("functions_dir", &self.resolver.root())
            .field("handle_prefix", &self.handle_prefix)
            .field("cached", &self.registry.len())
            .finish()
    }
}

async fn invoke_native(module: Arc<NativeModule>, request: NativeRequest) -> Result<Response> {
    let response = bridge::invoke_native(module, request).await?;
    Ok(bridge::relay_native(response))
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .fallback(handle_function)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_function(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return report(
                &method,
                &uri,
                GatewayError::PayloadTooLarge(state.max_body_bytes),
            );
        }
        Err(rejection) => {
            return report(
                &method,
                &uri,
                GatewayError::InvalidRequest(rejection.body_text()),
            );
        }
    };

    match state.invoke(method.clone(), &uri, headers, body).await {
        Ok(response) => response,
        Err(e) => report(&method, &uri, e),
    }
}

fn report(method: &Method, uri: &Uri, error: GatewayError) -> Response {
    let status = error.status_code();
    match &error {
        GatewayError::NotFound(_) => {
            debug!(method = %method, path = %uri.path(), "No function for request")
        }
        _ if status.is_server_error() => {
            error!(method = %method, path = %uri.path(), status = status.as_u16(), error = %error, "Function request failed")
        }
        _ => {
            warn!(method = %method, path = %uri.path(), status = status.as_u16(), error = %error, "Rejected function request")
        }
    }
    error.into_response()
}

/// Path left after removing `prefix`, or `None` when the path is outside it.
pub fn strip_handle_prefix<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn native_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
