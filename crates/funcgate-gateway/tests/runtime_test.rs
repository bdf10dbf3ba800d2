// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded runtime over real sockets.

mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use common::*;
use funcgate_gateway::runtime::GatewayRuntime;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

async fn start(project: &Project) -> GatewayRuntime {
    let mut config = project.config.clone();
    config.bind_addr = loopback();
    GatewayRuntime::builder()
        .config(config)
        .scratch_parent(project.root.path())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_runtime_serves_and_shuts_down() {
    let project = Project::new(NEVER_READY);
    project.function("hello.rs", NATIVE_OK);

    let runtime = start(&project).await;
    assert!(runtime.is_running());
    let base = format!("http://{}", runtime.local_addr());
    let scratch = runtime.scratch().path().to_path_buf();
    assert!(scratch.starts_with(project.root.path()));

    let client = reqwest::Client::new();
    let response = client.get(format!("{base}/hello")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok /hello");

    let response = client.get(format!("{base}/missing")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    assert_eq!(runtime.state().registry().len(), 1);
    drop(client);
    runtime.shutdown().await.unwrap();
    assert!(!scratch.exists());
}

#[tokio::test]
async fn test_runtime_start_fails_on_taken_port() {
    let project = Project::new(NEVER_READY);
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

    let mut config = project.config.clone();
    config.bind_addr = holder.local_addr().unwrap();
    let result = GatewayRuntime::builder()
        .config(config)
        .scratch_parent(project.root.path())
        .build()
        .unwrap()
        .start()
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_shutdown_abandons_hung_requests_after_grace_period() {
    let mut project = Project::new(NEVER_READY);
    project.config.shutdown_grace = Duration::from_millis(200);
    let slow = NATIVE_OK.replace(
        "let sink = unsafe",
        "std::thread::sleep(std::time::Duration::from_secs(3));\n    let sink = unsafe",
    );
    let source = project.function("slow.rs", &slow);

    let runtime = start(&project).await;
    let scratch = runtime.scratch().path().to_path_buf();
    let url = format!("http://{}/slow", runtime.local_addr());
    let request = tokio::spawn(async move { reqwest::get(url).await });

    // Wait for the build so the handler is running when shutdown starts.
    let deadline = Instant::now() + Duration::from_secs(60);
    while runtime.state().registry().cached(&source).is_none() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!request.is_finished());

    let started = Instant::now();
    runtime.shutdown().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert!(!scratch.exists());
    request.abort();
}

// ============================================================================
// End to end with a real script runtime and bundler
// ============================================================================

fn script_toolchain_available() -> bool {
    which::which("node").is_ok() && which::which("esbuild").is_ok()
}

#[tokio::test]
async fn test_script_function_end_to_end() {
    if !script_toolchain_available() {
        eprintln!("node or esbuild not on PATH; skipping");
        return;
    }

    let mut project = Project::new(NEVER_READY);
    project.config.bundler = "esbuild".into();
    project.config.script_runtime = "node".into();
    project.config.upstream_timeout = Duration::from_secs(10);
    project.config.ready_timeout = Duration::from_secs(15);
    project.function(
        "hello.js",
        "module.exports = (req, res) => { res.status(200).send('ok'); };",
    );
    project.function(
        "users/index.ts",
        "export default (req: any, res: any) => { res.json({ name: req.query.name, body: req.body }); };",
    );

    let runtime = start(&project).await;
    let base = format!("http://{}", runtime.local_addr());
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/hello")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.text().await.unwrap(), "ok");

    let response = client
        .post(format!("{base}/users?name=ada"))
        .header("content-type", "application/json")
        .body(r#"{"id":7}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.text().await.unwrap(),
        r#"{"name":"ada","body":{"id":7}}"#
    );

    // Runtimes are torn down once their response has been relayed.
    let scratch = runtime.scratch().path().to_path_buf();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !bootstrap_files(&scratch).is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(bootstrap_files(&scratch).is_empty());

    drop(client);
    runtime.shutdown().await.unwrap();
}
