// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the funcgate gateway.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use funcgate_build::DEFAULT_IGNORE;

/// Inclusive range of loopback ports handed to script runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port (inclusive).
    pub end: u16,
}

impl PortRange {
    /// Number of ports in the range.
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false; a range holds at least one port.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl FromStr for PortRange {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or("must be START-END, e.g. 9401-9500")?;
        let start: u16 = start.trim().parse().map_err(|_| "start is not a port")?;
        let end: u16 = end.trim().parse().map_err(|_| "end is not a port")?;
        if start == 0 || start > end {
            return Err("start must be non-zero and not above end");
        }
        Ok(Self { start, end })
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// URL prefix under which functions are served (`/` or `/v1/functions`).
    pub handle_prefix: String,
    /// Project working directory.
    pub working_dir: PathBuf,
    /// Root directory holding function sources.
    pub functions_dir: PathBuf,
    /// Bundler working directory (where shared `node_modules` resolve).
    pub build_dir: PathBuf,
    /// Path fragments skipped while resolving.
    pub ignore: Vec<String>,
    /// Development env file handed to functions.
    pub env_file: PathBuf,
    /// Script bundler executable.
    pub bundler: PathBuf,
    /// Script runtime executable.
    pub script_runtime: PathBuf,
    /// Rust compiler for native functions.
    pub rustc: PathBuf,
    /// `-C opt-level` for native functions.
    pub native_opt_level: String,
    /// Loopback ports for script runtimes.
    pub runtime_ports: PortRange,
    /// Bound on one build.
    pub build_timeout: Duration,
    /// Bound on a script runtime becoming ready.
    pub ready_timeout: Duration,
    /// Bound on the connection retry loop towards a runtime.
    pub upstream_timeout: Duration,
    /// Delay between connection attempts.
    pub retry_interval: Duration,
    /// Most prepared functions kept at once.
    pub max_cached_functions: usize,
    /// Prepared functions unused for this long are evicted.
    pub idle_ttl: Duration,
    /// How often idle functions are swept.
    pub sweep_interval: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// How long shutdown waits for in-flight requests before abandoning them.
    pub shutdown_grace: Duration,
    /// Variables contributed by an attached execution environment.
    pub runtime_vars: Vec<(String, String)>,
}

impl GatewayConfig {
    /// Defaults for a project rooted at `working_dir`.
    ///
    /// A relative `working_dir` is resolved against the current directory.
    pub fn for_working_dir(working_dir: impl Into<PathBuf>) -> Self {
        let working_dir = absolute(working_dir.into());
        let functions_dir = working_dir.join("functions");
        let build_dir = default_build_dir(&working_dir, &functions_dir);
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            handle_prefix: "/".to_string(),
            env_file: working_dir.join(".env.development"),
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
            bundler: PathBuf::from("esbuild"),
            script_runtime: PathBuf::from("node"),
            rustc: PathBuf::from("rustc"),
            native_opt_level: "0".to_string(),
            runtime_ports: PortRange {
                start: 9401,
                end: 9500,
            },
            build_timeout: Duration::from_secs(120),
            ready_timeout: Duration::from_secs(15),
            upstream_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(60),
            max_cached_functions: 256,
            idle_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            max_body_bytes: 16 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(10),
            runtime_vars: Vec::new(),
            working_dir,
            functions_dir,
            build_dir,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `FUNCGATE_PORT`: listen port (default: 7777)
    /// - `FUNCGATE_HANDLE_PREFIX`: URL prefix (default: `/`)
    /// - `FUNCGATE_WORKING_DIR`: project directory (default: `.`)
    /// - `FUNCGATE_FUNCTIONS_DIR`: functions root (default: `<working>/functions`)
    /// - `FUNCGATE_BUILD_DIR`: bundler working directory (default: functions root
    ///   if it has a `package.json`, else the working directory)
    /// - `FUNCGATE_IGNORE`: comma-separated ignore fragments
    /// - `FUNCGATE_ENV_FILE`: env file for functions (default: `<working>/.env.development`)
    /// - `FUNCGATE_BUNDLER`, `FUNCGATE_SCRIPT_RUNTIME`, `FUNCGATE_RUSTC`: tool executables
    /// - `FUNCGATE_NATIVE_OPT_LEVEL`: opt-level for native functions (default: 0)
    /// - `FUNCGATE_RUNTIME_PORTS`: `START-END` (default: 9401-9500)
    /// - `FUNCGATE_BUILD_TIMEOUT_SECS` (120), `FUNCGATE_READY_TIMEOUT_SECS` (15),
    ///   `FUNCGATE_UPSTREAM_TIMEOUT_SECS` (30), `FUNCGATE_RETRY_INTERVAL_MS` (60)
    /// - `FUNCGATE_MAX_CACHED_FUNCTIONS` (256), `FUNCGATE_IDLE_TTL_SECS` (3600),
    ///   `FUNCGATE_SWEEP_INTERVAL_SECS` (300)
    /// - `FUNCGATE_MAX_BODY_BYTES` (16 MiB)
    /// - `FUNCGATE_SHUTDOWN_GRACE_SECS` (10)
    /// - `FUNCGATE_RUNTIME_VARS`: `KEY=VALUE,...` from an attached environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let working_dir = var("FUNCGATE_WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::for_working_dir(working_dir);

        let port: u16 = parse_var("FUNCGATE_PORT", 7777, "must be a valid port number")?;
        config.bind_addr = SocketAddr::from(([0, 0, 0, 0], port));

        if let Some(prefix) = var("FUNCGATE_HANDLE_PREFIX") {
            config.handle_prefix = normalize_prefix(&prefix);
        }

        if let Some(dir) = var("FUNCGATE_FUNCTIONS_DIR") {
            config.functions_dir = absolute(PathBuf::from(dir));
        }
        config.build_dir = match var("FUNCGATE_BUILD_DIR") {
            Some(dir) => absolute(PathBuf::from(dir)),
            None => default_build_dir(&config.working_dir, &config.functions_dir),
        };

        if let Some(ignore) = var("FUNCGATE_IGNORE") {
            config.ignore = ignore
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(file) = var("FUNCGATE_ENV_FILE") {
            config.env_file = absolute(PathBuf::from(file));
        }
        if let Some(bundler) = var("FUNCGATE_BUNDLER") {
            config.bundler = PathBuf::from(bundler);
        }
        if let Some(runtime) = var("FUNCGATE_SCRIPT_RUNTIME") {
            config.script_runtime = PathBuf::from(runtime);
        }
        if let Some(rustc) = var("FUNCGATE_RUSTC") {
            config.rustc = PathBuf::from(rustc);
        }
        if let Some(level) = var("FUNCGATE_NATIVE_OPT_LEVEL") {
            if !matches!(level.as_str(), "0" | "1" | "2" | "3" | "s" | "z") {
                return Err(ConfigError::Invalid(
                    "FUNCGATE_NATIVE_OPT_LEVEL",
                    "must be one of 0, 1, 2, 3, s, z",
                ));
            }
            config.native_opt_level = level;
        }

        if let Some(range) = var("FUNCGATE_RUNTIME_PORTS") {
            config.runtime_ports = range
                .parse()
                .map_err(|reason| ConfigError::Invalid("FUNCGATE_RUNTIME_PORTS", reason))?;
        }

        config.build_timeout = Duration::from_secs(parse_positive(
            "FUNCGATE_BUILD_TIMEOUT_SECS",
            120,
        )?);
        config.ready_timeout = Duration::from_secs(parse_positive(
            "FUNCGATE_READY_TIMEOUT_SECS",
            15,
        )?);
        config.upstream_timeout = Duration::from_secs(parse_positive(
            "FUNCGATE_UPSTREAM_TIMEOUT_SECS",
            30,
        )?);
        config.retry_interval = Duration::from_millis(parse_positive(
            "FUNCGATE_RETRY_INTERVAL_MS",
            60,
        )?);
        config.max_cached_functions =
            parse_positive("FUNCGATE_MAX_CACHED_FUNCTIONS", 256u64)? as usize;
        config.idle_ttl = Duration::from_secs(parse_positive("FUNCGATE_IDLE_TTL_SECS", 3600)?);
        config.sweep_interval = Duration::from_secs(parse_positive(
            "FUNCGATE_SWEEP_INTERVAL_SECS",
            300,
        )?);
        config.max_body_bytes =
            parse_positive("FUNCGATE_MAX_BODY_BYTES", 16 * 1024 * 1024)? as usize;
        config.shutdown_grace = Duration::from_secs(parse_positive(
            "FUNCGATE_SHUTDOWN_GRACE_SECS",
            10,
        )?);

        if let Some(vars) = var("FUNCGATE_RUNTIME_VARS") {
            config.runtime_vars = parse_runtime_vars(&vars)?;
        }

        Ok(config)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, reason)),
        None => Ok(default),
    }
}

fn parse_positive(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value = parse_var(key, default, "must be a positive integer")?;
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

fn parse_runtime_vars(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(ConfigError::Invalid(
                "FUNCGATE_RUNTIME_VARS",
                "must be a comma-separated list of KEY=VALUE",
            )),
        })
        .collect()
}

/// Normalise a handle prefix to `/segment[/segment...]` without a trailing slash.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// `path` made absolute against the current directory, unchanged if that fails.
fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

fn default_build_dir(working_dir: &Path, functions_dir: &Path) -> PathBuf {
    if functions_dir.join("package.json").is_file() {
        functions_dir.to_path_buf()
    } else {
        working_dir.to_path_buf()
    }
}
