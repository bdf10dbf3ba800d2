// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment variables handed to function runtimes.
//!
//! The set is built once, on the first invocation that needs it: the gateway's
//! own environment, overlaid with the development env file, overlaid with
//! whatever an attached execution environment contributes while it is active.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Source of extra variables from an execution environment the gateway is attached to.
pub trait AttachedEnvironment: Send + Sync {
    /// Whether the environment is running and its variables apply.
    fn is_active(&self) -> bool;

    /// Variables to add to every function runtime.
    fn runtime_vars(&self) -> Vec<(String, String)>;
}

/// No attached environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedEnvironment;

impl AttachedEnvironment for DetachedEnvironment {
    fn is_active(&self) -> bool {
        false
    }

    fn runtime_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Fixed set of variables, active whenever it is non-empty.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    vars: Vec<(String, String)>,
}

impl StaticEnvironment {
    /// Wrap a list of variables.
    pub fn new(vars: Vec<(String, String)>) -> Self {
        Self { vars }
    }
}

impl AttachedEnvironment for StaticEnvironment {
    fn is_active(&self) -> bool {
        !self.vars.is_empty()
    }

    fn runtime_vars(&self) -> Vec<(String, String)> {
        self.vars.clone()
    }
}

/// Immutable set of variables for function runtimes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Build a snapshot from the process environment, `env_file`, and `attached`.
    ///
    /// A missing env file is not an error. Later sources win on conflicts.
    pub fn load(env_file: &Path, attached: &dyn AttachedEnvironment) -> Self {
        let mut vars: BTreeMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();

        match dotenvy::from_path_iter(env_file) {
            Ok(entries) => {
                let mut loaded = 0usize;
                for entry in entries {
                    match entry {
                        Ok((key, value)) => {
                            vars.insert(key, value);
                            loaded += 1;
                        }
                        Err(e) => {
                            warn!(path = %env_file.display(), error = %e, "Skipping malformed env file line");
                        }
                    }
                }
                info!(path = %env_file.display(), count = loaded, "Loaded function env file");
            }
            Err(e) if e.not_found() => {
                debug!(path = %env_file.display(), "No function env file");
            }
            Err(e) => {
                warn!(path = %env_file.display(), error = %e, "Failed to read function env file");
            }
        }

        if attached.is_active() {
            let runtime_vars = attached.runtime_vars();
            debug!(count = runtime_vars.len(), "Merging attached environment variables");
            vars.extend(runtime_vars);
        }

        Self { vars }
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up one variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// All variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Lazily loaded, process-wide runtime environment.
pub struct ExecutionEnvironment {
    env_file: PathBuf,
    attached: Arc<dyn AttachedEnvironment>,
    snapshot: OnceCell<Arc<EnvSnapshot>>,
}

impl ExecutionEnvironment {
    /// Create an environment that loads on first use.
    pub fn new(env_file: impl Into<PathBuf>, attached: Arc<dyn AttachedEnvironment>) -> Self {
        Self {
            env_file: env_file.into(),
            attached,
            snapshot: OnceCell::new(),
        }
    }

    /// Snapshot of the variables, loading it on the first call.
    pub async fn snapshot(&self) -> Arc<EnvSnapshot> {
        self.snapshot
            .get_or_init(|| async {
                Arc::new(EnvSnapshot::load(&self.env_file, self.attached.as_ref()))
            })
            .await
            .clone()
    }

    /// Whether the snapshot has been loaded yet.
    pub fn is_loaded(&self) -> bool {
        self.snapshot.initialized()
    }
}

impl std::fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("env_file", &self.env_file)
            .field("attached_active", &self.attached.is_active())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detached_environment() {
        let env = DetachedEnvironment;
        assert!(!env.is_active());
        assert!(env.runtime_vars().is_empty());
    }

    #[test]
    fn test_static_environment_is_active_when_non_empty() {
        assert!(!StaticEnvironment::default().is_active());
        let env = StaticEnvironment::new(vec![("A".into(), "1".into())]);
        assert!(env.is_active());
        assert_eq!(env.runtime_vars(), vec![("A".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_snapshot_overlays_env_file_and_runtime_vars() {
        let dir = TempDir::new().unwrap();
        let env_file = dir.path().join(".env.development");
        std::fs::write(
            &env_file,
            "FUNCGATE_TEST_FROM_FILE=file\nFUNCGATE_TEST_SHARED=file\n",
        )
        .unwrap();

        let attached = StaticEnvironment::new(vec![
            ("FUNCGATE_TEST_SHARED".into(), "runtime".into()),
            ("FUNCGATE_TEST_RUNTIME".into(), "yes".into()),
        ]);
        let snapshot = EnvSnapshot::load(&env_file, &attached);

        assert_eq!(snapshot.get("FUNCGATE_TEST_FROM_FILE"), Some("file"));
        assert_eq!(snapshot.get("FUNCGATE_TEST_SHARED"), Some("runtime"));
        assert_eq!(snapshot.get("FUNCGATE_TEST_RUNTIME"), Some("yes"));
    }

    #[test]
    fn test_snapshot_without_env_file_keeps_process_env() {
        let dir = TempDir::new().unwrap();
        let snapshot = EnvSnapshot::load(&dir.path().join("missing.env"), &DetachedEnvironment);

        // PATH is present in any environment that can run the test suite.
        assert!(snapshot.get("PATH").is_some());
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn test_inactive_environment_contributes_nothing() {
        let dir = TempDir::new().unwrap();
        let snapshot = EnvSnapshot::load(&dir.path().join("missing.env"), &DetachedEnvironment);
        assert_eq!(snapshot.get("FUNCGATE_TEST_RUNTIME"), None);
    }

    #[tokio::test]
    async fn test_execution_environment_loads_once() {
        let dir = TempDir::new().unwrap();
        let env_file = dir.path().join(".env.development");
        std::fs::write(&env_file, "FUNCGATE_TEST_ONCE=first\n").unwrap();

        let env = ExecutionEnvironment::new(&env_file, Arc::new(DetachedEnvironment));
        assert!(!env.is_loaded());

        let first = env.snapshot().await;
        assert_eq!(first.get("FUNCGATE_TEST_ONCE"), Some("first"));

        std::fs::write(&env_file, "FUNCGATE_TEST_ONCE=second\n").unwrap();
        let second = env.snapshot().await;
        assert_eq!(second.get("FUNCGATE_TEST_ONCE"), Some("first"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_from_pairs() {
        let snapshot = EnvSnapshot::from_pairs([("B", "2"), ("A", "1")]);
        let keys: Vec<&str> = snapshot.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert_eq!(snapshot.len(), 2);
    }
}
