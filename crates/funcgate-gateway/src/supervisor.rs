// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ephemeral script runtimes.
//!
//! Each request to a script function gets its own runtime process: a
//! generated bootstrap is written next to the function's artifacts, the
//! runtime executable is started on a free loopback port, and the request
//! waits until the bootstrap announces readiness on stdout.
//!
//! The returned [`EphemeralRuntime`] owns both the process and the bootstrap
//! file; dropping it kills the one and deletes the other, whichever way the
//! request ends.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use funcgate_build::{Artifact, BuiltFunction};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{self, EXIT_NO_HANDLER};
use crate::config::PortRange;
use crate::env::EnvSnapshot;
use crate::scratch::ScratchDir;

/// Log target for output produced by function runtimes.
pub const FUNCTION_LOG_TARGET: &str = "funcgate::function";

const STDERR_TAIL_LINES: usize = 20;

/// Errors from starting a script runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Runtime executable is not installed.
    #[error("Script runtime not found: {0}")]
    RuntimeNotFound(String),

    /// Function was not built as a script bundle.
    #[error("Function {0} is not a script bundle")]
    NotScript(String),

    /// Every port in the configured range is taken.
    #[error("No free port in range {start}-{end}")]
    NoFreePort {
        /// First port of the range.
        start: u16,
        /// Last port of the range.
        end: u16,
    },

    /// Runtime process could not be started.
    #[error("Failed to start script runtime: {0}")]
    Spawn(#[source] std::io::Error),

    /// Runtime exited before it was ready.
    #[error("Script runtime exited before becoming ready ({status}): {stderr}")]
    Exited {
        /// Exit status description.
        status: String,
        /// Last lines of stderr.
        stderr: String,
    },

    /// Runtime did not announce readiness in time.
    #[error("Script runtime did not become ready within {}ms", .0.as_millis())]
    ReadinessTimeout(Duration),

    /// Writing the bootstrap failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Whether the runtime was given up on because of its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SupervisorError::ReadinessTimeout(_))
    }
}

/// Script runtime settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Runtime executable, by name or path.
    pub runtime: PathBuf,
    /// Loopback ports to hand out.
    pub ports: PortRange,
    /// Bound on the readiness handshake.
    pub ready_timeout: Duration,
}

/// Starts ephemeral runtimes for script functions.
#[derive(Debug)]
pub struct RuntimeSupervisor {
    config: SupervisorConfig,
    scratch: Arc<ScratchDir>,
    next_port: AtomicUsize,
}

impl RuntimeSupervisor {
    /// Create a supervisor writing bootstraps under `scratch`.
    pub fn new(config: SupervisorConfig, scratch: Arc<ScratchDir>) -> Self {
        Self {
            config,
            scratch,
            next_port: AtomicUsize::new(0),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start a runtime serving `function` and wait until it accepts requests.
    pub async fn launch(
        &self,
        function: &BuiltFunction,
        env: &EnvSnapshot,
    ) -> Result<EphemeralRuntime, SupervisorError> {
        let descriptor = &function.descriptor;
        let Artifact::Bundle { path: bundle } = &function.artifact else {
            return Err(SupervisorError::NotScript(descriptor.route.clone()));
        };

        let runtime = which::which(&self.config.runtime).map_err(|_| {
            SupervisorError::RuntimeNotFound(self.config.runtime.display().to_string())
        })?;
        let port = self.pick_port()?;

        let bootstrap_dir = self
            .scratch
            .path()
            .join(descriptor.base_dir.trim_start_matches('/'));
        let source = bootstrap::render(&descriptor.route, bundle, &descriptor.source_path, port);
        let bootstrap_path = bootstrap::write(&bootstrap_dir, descriptor.file_stem(), &source)?;

        let mut cmd = Command::new(&runtime);
        cmd.arg(&bootstrap_path)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&bootstrap_path);
                return Err(match e.kind() {
                    ErrorKind::NotFound => {
                        SupervisorError::RuntimeNotFound(runtime.display().to_string())
                    }
                    _ => SupervisorError::Spawn(e),
                });
            }
        };

        let mut instance = EphemeralRuntime {
            pid: child.id(),
            child,
            port,
            bootstrap_path,
            route: descriptor.route.clone(),
        };

        debug!(
            route = %instance.route,
            pid = ?instance.pid,
            port,
            bootstrap = %instance.bootstrap_path.display(),
            "Started script runtime"
        );

        match self.await_ready(&mut instance).await {
            Ok(()) => {
                info!(route = %instance.route, pid = ?instance.pid, port, "Script runtime ready");
                Ok(instance)
            }
            Err(e) => {
                error!(route = %instance.route, error = %e, "Script runtime failed to start");
                Err(e)
            }
        }
    }

    async fn await_ready(&self, instance: &mut EphemeralRuntime) -> Result<(), SupervisorError> {
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = instance
            .child
            .stderr
            .take()
            .map(|stderr| forward_stderr(stderr, instance.route.clone(), Arc::clone(&stderr_tail)));

        let Some(stdout) = instance.child.stdout.take() else {
            return Err(SupervisorError::Spawn(std::io::Error::other(
                "runtime stdout was not captured",
            )));
        };
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::sleep(self.config.ready_timeout);
        tokio::pin!(deadline);

        let exit_status = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if bootstrap::parse_ready_line(&line) == Some(instance.port) {
                            break None;
                        }
                        info!(target: FUNCTION_LOG_TARGET, route = %instance.route, stream = "stdout", "{}", line);
                    }
                    // Stdout closed: the process is on its way out.
                    Ok(None) | Err(_) => {
                        let status = tokio::time::timeout(Duration::from_secs(1), instance.child.wait()).await;
                        break Some(match status {
                            Ok(Ok(status)) => describe_exit(status),
                            _ => "stdout closed".to_string(),
                        });
                    }
                },
                status = instance.child.wait() => {
                    break Some(match status {
                        Ok(status) => describe_exit(status),
                        Err(e) => e.to_string(),
                    });
                }
                _ = &mut deadline => {
                    return Err(SupervisorError::ReadinessTimeout(self.config.ready_timeout));
                }
            }
        };

        let Some(status) = exit_status else {
            let route = instance.route.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: FUNCTION_LOG_TARGET, route = %route, stream = "stdout", "{}", line);
                }
            });
            return Ok(());
        };

        // Let the stderr forwarder drain so the tail is complete.
        if let Some(task) = stderr_task {
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }
        let stderr = match stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect::<Vec<_>>().join("\n"),
        };
        Err(SupervisorError::Exited { status, stderr })
    }

    fn pick_port(&self) -> Result<u16, SupervisorError> {
        let range = self.config.ports;
        let len = range.len();
        for _ in 0..len {
            let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % len;
            let port = range.start + offset as u16;
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(port);
            }
        }
        Err(SupervisorError::NoFreePort {
            start: range.start,
            end: range.end,
        })
    }
}

fn forward_stderr(
    stderr: ChildStderr,
    route: String,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(target: FUNCTION_LOG_TARGET, route = %route, stream = "stderr", "{}", line);
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    })
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(EXIT_NO_HANDLER) => format!("exit code {}: no callable export", EXIT_NO_HANDLER),
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    }
}

/// A running script runtime, owned by one request.
#[derive(Debug)]
pub struct EphemeralRuntime {
    child: Child,
    pid: Option<u32>,
    port: u16,
    bootstrap_path: PathBuf,
    route: String,
}

impl EphemeralRuntime {
    /// Loopback port the runtime listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL for requests to the runtime.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// OS process id, if the process was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Generated bootstrap file.
    pub fn bootstrap_path(&self) -> &Path {
        &self.bootstrap_path
    }
}

impl Drop for EphemeralRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited.
            debug!(route = %self.route, error = %e, "Script runtime not killed");
        }
        // Reap right away if it is already gone.
        let _ = self.child.try_wait();

        match std::fs::remove_file(&self.bootstrap_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.bootstrap_path.display(),
                error = %e,
                "Failed to remove bootstrap file"
            ),
        }
        debug!(route = %self.route, pid = ?self.pid, "Script runtime stopped");
    }
}

/// Whether `pid` names a live (non-zombie) process.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return false,
        // EPERM: exists, but not ours.
        Err(_) => return true,
    }
    // A killed child stays visible until reaped; treat zombies as dead.
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_none_or(|state| state != 'Z' && state != 'X'),
        Err(_) => true,
    }
}
