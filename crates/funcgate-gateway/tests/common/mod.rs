// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for gateway tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use funcgate_gateway::config::{GatewayConfig, PortRange};
use funcgate_gateway::env::DetachedEnvironment;
use funcgate_gateway::scratch::ScratchDir;
use funcgate_gateway::server::{GatewayState, router};
use funcgate_gateway::supervisor::process_alive;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

/// Stand-in for esbuild: copies the entry to `--outfile`, or fails with a
/// diagnostic when the entry contains `SYNTAX_ERROR`.
pub const FAKE_BUNDLER: &str = r#"#!/bin/sh
entry="$1"
shift
out=""
for arg in "$@"; do
  case "$arg" in
    --outfile=*) out="${arg#--outfile=}" ;;
  esac
done
if grep -q SYNTAX_ERROR "$entry"; then
  echo "✘ [ERROR] Unexpected \"SYNTAX_ERROR\" in $entry" >&2
  exit 1
fi
cp "$entry" "$out"
"#;

/// Runtime that announces readiness on the bootstrap's port but never listens.
pub const READY_NOT_LISTENING: &str = r#"#!/bin/sh
port=""
while IFS= read -r line; do
  case "$line" in
    "const PORT = "*) port="${line#const PORT = }"; port="${port%;}" ;;
  esac
done < "$1"
echo "starting on $port"
echo "FUNCGATE_READY $port"
exec sleep 30
"#;

/// Runtime that exits the way the bootstrap does when nothing is exported.
pub const EXITS_NO_HANDLER: &str = r#"#!/bin/sh
echo "funcgate: handler.js must export a function" >&2
exit 78
"#;

/// Runtime that never becomes ready.
pub const NEVER_READY: &str = r#"#!/bin/sh
exec sleep 30
"#;

/// Runtime that only becomes ready when `GREETING=hi` is in its environment.
pub const NEEDS_GREETING: &str = r#"#!/bin/sh
if [ "$GREETING" != "hi" ]; then
  echo "GREETING is '$GREETING'" >&2
  exit 3
fi
port=""
while IFS= read -r line; do
  case "$line" in
    "const PORT = "*) port="${line#const PORT = }"; port="${port%;}" ;;
  esac
done < "$1"
echo "FUNCGATE_READY $port"
exec sleep 30
"#;

/// Write an executable shell script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Write `contents` to `root/rel`, creating parent directories.
pub fn write_source(root: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    path
}

/// Every regular file below `dir`.
pub fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            out.extend(walk_files(&path));
        } else {
            out.push(path);
        }
    }
    out
}

/// Generated bootstrap files currently below `dir`.
pub fn bootstrap_files(dir: &Path) -> Vec<PathBuf> {
    walk_files(dir)
        .into_iter()
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().contains("-server-"))
                .unwrap_or(false)
        })
        .collect()
}

/// Wait until `pid` is gone, for at most `timeout`.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !process_alive(pid)
}

/// A free loopback port range of `len` ports, checked at call time.
pub fn port_range(len: u16) -> PortRange {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let start = listener.local_addr().unwrap().port();
    drop(listener);
    let end = start.saturating_add(len.saturating_sub(1));
    PortRange { start, end }
}

/// A project laid out as `<root>/api/...` with fake tools.
pub struct Project {
    pub root: TempDir,
    pub tools: TempDir,
    pub config: GatewayConfig,
}

impl Project {
    /// Empty project whose script runtime is the given shell script.
    pub fn new(runtime_script: &str) -> Self {
        let root = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("api")).unwrap();

        let mut config = GatewayConfig::for_working_dir(root.path());
        config.functions_dir = root.path().join("api");
        config.build_dir = root.path().to_path_buf();
        config.env_file = root.path().join(".env.development");
        config.bundler = write_script(tools.path(), "fake-esbuild", FAKE_BUNDLER);
        config.script_runtime = write_script(tools.path(), "fake-node", runtime_script);
        config.runtime_ports = port_range(50);
        config.build_timeout = Duration::from_secs(60);
        config.ready_timeout = Duration::from_secs(5);
        config.upstream_timeout = Duration::from_millis(400);
        config.retry_interval = Duration::from_millis(20);

        Self {
            root,
            tools,
            config,
        }
    }

    /// Functions root.
    pub fn api(&self) -> PathBuf {
        self.root.path().join("api")
    }

    /// Write a function source under the functions root.
    pub fn function(&self, rel: &str, contents: &str) -> PathBuf {
        write_source(&self.api(), rel, contents)
    }

    /// Gateway state and router over a fresh scratch directory.
    pub fn gateway(&self) -> (Arc<GatewayState>, Router, Arc<ScratchDir>) {
        let scratch = Arc::new(ScratchDir::new_in(self.root.path()).unwrap());
        let state = Arc::new(
            GatewayState::new(
                &self.config,
                Arc::clone(&scratch),
                Arc::new(DetachedEnvironment),
            )
            .unwrap(),
        );
        let app = router(Arc::clone(&state));
        (state, app, scratch)
    }
}

/// Send one request through the router and collect the response.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

/// `GET uri` with an empty body.
pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Native module that answers `ok <path>` as text/plain.
pub const NATIVE_OK: &str = r#"
use std::ffi::c_void;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Str { ptr: *const u8, len: usize }

#[repr(C)]
pub struct Header { name: Str, value: Str }

#[repr(C)]
pub struct Request {
    method: Str,
    path: Str,
    query: Str,
    headers: *const Header,
    headers_len: usize,
    body: Str,
}

#[repr(C)]
pub struct ResponseSink {
    context: *mut c_void,
    set_status: extern "C" fn(*mut c_void, u16),
    set_header: extern "C" fn(*mut c_void, Str, Str),
    write: extern "C" fn(*mut c_void, Str),
}

fn s(bytes: &[u8]) -> Str {
    Str { ptr: bytes.as_ptr(), len: bytes.len() }
}

#[no_mangle]
pub static HANDLER_SIGNATURE: [u8; 40] = *b"fn(*const ResponseSink, *const Request)\0";

#[no_mangle]
pub extern "C" fn Handler(sink: *const ResponseSink, request: *const Request) {
    let sink = unsafe { &*sink };
    let request = unsafe { &*request };
    (sink.set_status)(sink.context, 200);
    (sink.set_header)(sink.context, s(b"content-type"), s(b"text/plain"));
    (sink.write)(sink.context, s(b"ok "));
    (sink.write)(sink.context, request.path);
}
"#;

/// Handler with some other shape and no signature tag.
pub const NATIVE_WRONG_SIGNATURE: &str = r#"
#[no_mangle]
pub extern "C" fn Handler(code: i32) -> i32 {
    code + 1
}
"#;
