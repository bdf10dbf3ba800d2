// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of prepared functions.
//!
//! Entries are keyed by source path. Each key owns an async slot lock, so
//! "build or wait" is one atomic step: the first request for a path builds,
//! concurrent requests for the same path wait for that build and share its
//! result, and requests for other paths are not held up at all.
//!
//! An entry is reused while the source's modification time is unchanged.
//! A changed time evicts the entry before the rebuild starts. Beyond that the
//! registry is bounded in size (least recently used idle entries go first)
//! and idle entries age out through [`FunctionRegistry::evict_idle`].
//!
//! Evicting an entry only drops the registry's reference. The artifact
//! directory belongs to the [`BuiltFunction`] and is removed once the last
//! request holding that build finishes with it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use funcgate_build::{BuildError, Builder, BuiltFunction, FunctionDescriptor};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::scratch::ScratchDir;

struct Slot {
    state: Mutex<Option<Arc<BuiltFunction>>>,
    last_used_ms: AtomicU64,
}

impl Slot {
    fn new(now_ms: u64) -> Self {
        Self {
            state: Mutex::new(None),
            last_used_ms: AtomicU64::new(now_ms),
        }
    }
}

/// Cache of built functions with at most one build per source path in flight.
pub struct FunctionRegistry {
    builder: Builder,
    scratch: Arc<ScratchDir>,
    slots: DashMap<PathBuf, Arc<Slot>>,
    capacity: usize,
    builds: AtomicU64,
    epoch: Instant,
}

impl FunctionRegistry {
    /// Create a registry that builds into `scratch` and holds at most `capacity` entries.
    pub fn new(builder: Builder, scratch: Arc<ScratchDir>, capacity: usize) -> Self {
        Self {
            builder,
            scratch,
            slots: DashMap::new(),
            capacity: capacity.max(1),
            builds: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Return the prepared function for `descriptor`, building it if needed.
    pub async fn get_or_build(
        &self,
        descriptor: &FunctionDescriptor,
    ) -> Result<Arc<BuiltFunction>, BuildError> {
        let slot = self
            .slots
            .entry(descriptor.source_path.clone())
            .or_insert_with(|| Arc::new(Slot::new(self.now_ms())))
            .clone();
        slot.last_used_ms.store(self.now_ms(), Ordering::Relaxed);

        let mut state = slot.state.lock().await;

        if let Some(current) = state.as_ref() {
            if current.descriptor.source_mod_time == descriptor.source_mod_time {
                debug!(route = %descriptor.route, "Function cache hit");
                return Ok(Arc::clone(current));
            }
            info!(
                route = %descriptor.route,
                artifact_dir = %current.artifact_dir.display(),
                in_use = Arc::strong_count(current) > 1,
                "Source changed, evicting stale build"
            );
            *state = None;
        }

        self.builds.fetch_add(1, Ordering::Relaxed);
        let built = Arc::new(self.builder.build(descriptor, self.scratch.path()).await?);
        *state = Some(Arc::clone(&built));
        drop(state);
        drop(slot);

        self.enforce_capacity(&descriptor.source_path);
        Ok(built)
    }

    /// Cached build for `source_path`, if one is ready and not being rebuilt.
    pub fn cached(&self, source_path: &Path) -> Option<Arc<BuiltFunction>> {
        let slot = self.slots.get(source_path)?.clone();
        let state = slot.state.try_lock().ok()?;
        state.clone()
    }

    /// Number of builds started since creation.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Number of ready entries.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| match entry.value().state.try_lock() {
                Ok(state) => state.is_some(),
                // Locked means a build is running or a request is reading it.
                Err(_) => true,
            })
            .count()
    }

    /// Whether no entry is ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Scratch directory builds are written to.
    pub fn scratch(&self) -> &Arc<ScratchDir> {
        &self.scratch
    }

    /// Evict idle entries not used within `ttl`. Returns how many were evicted.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = self.now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let expired: Vec<PathBuf> = self
            .slots
            .iter()
            .filter(|entry| now.saturating_sub(entry.value().last_used_ms.load(Ordering::Relaxed)) >= ttl_ms)
            .map(|entry| entry.key().clone())
            .collect();

        let evicted = expired.iter().filter(|path| self.evict(path)).count();
        if evicted > 0 {
            info!(evicted, remaining = self.slots.len(), "Evicted idle functions");
        }
        evicted
    }

    /// Drop every entry. Artifacts still held by requests outlive the call.
    pub fn clear(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    /// Evict one entry if nobody is using it. Returns whether it was removed.
    fn evict(&self, source_path: &Path) -> bool {
        let removed = self.slots.remove_if(source_path, |_, slot| {
            Arc::strong_count(slot) == 1
                && match slot.state.try_lock() {
                    Ok(state) => state.as_ref().is_none_or(|b| Arc::strong_count(b) == 1),
                    Err(_) => false,
                }
        });

        let Some((_, slot)) = removed else {
            return false;
        };
        if let Ok(mut state) = slot.state.try_lock()
            && let Some(built) = state.take()
        {
            debug!(
                route = %built.descriptor.route,
                artifact_dir = %built.artifact_dir.display(),
                "Evicted function"
            );
        }
        true
    }

    fn enforce_capacity(&self, keep: &Path) {
        let ready = self.len();
        if ready <= self.capacity {
            return;
        }

        let mut candidates: Vec<(PathBuf, u64)> = self
            .slots
            .iter()
            .filter(|entry| entry.key().as_path() != keep)
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().last_used_ms.load(Ordering::Relaxed),
                )
            })
            .collect();
        candidates.sort_by_key(|(_, last_used)| *last_used);

        let mut excess = ready - self.capacity;
        for (path, _) in candidates {
            if excess == 0 {
                break;
            }
            if self.evict(&path) {
                excess -= 1;
            }
        }
        if excess > 0 {
            debug!(excess, "Function registry over capacity; remaining entries are in use");
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("entries", &self.slots.len())
            .field("capacity", &self.capacity)
            .field("builds", &self.builds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funcgate_build::{BuildOptions, FunctionKind, Resolver, Toolchain};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const COPY_BUNDLER: &str = "#!/bin/sh\nentry=\"$1\"\nshift\nfor a in \"$@\"; do case \"$a\" in --outfile=*) out=\"${a#--outfile=}\";; esac; done\ncp \"$entry\" \"$out\"\n";

    struct Fixture {
        functions: TempDir,
        _tools: TempDir,
        registry: FunctionRegistry,
    }

    fn fixture(capacity: usize) -> Fixture {
        let functions = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let bundler = tools.path().join("bundler");
        std::fs::write(&bundler, COPY_BUNDLER).unwrap();
        std::fs::set_permissions(&bundler, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut options = BuildOptions::new(functions.path());
        options.toolchain = Toolchain {
            bundler,
            ..Toolchain::default()
        };
        let scratch = Arc::new(ScratchDir::new().unwrap());
        let registry = FunctionRegistry::new(Builder::new(options), scratch, capacity);
        Fixture {
            functions,
            _tools: tools,
            registry,
        }
    }

    fn write(fx: &Fixture, name: &str) -> FunctionDescriptor {
        std::fs::write(fx.functions.path().join(name), "module.exports = () => {}").unwrap();
        let route = format!("/{}", name.trim_end_matches(".js"));
        Resolver::new(fx.functions.path()).resolve(&route).unwrap()
    }

    #[tokio::test]
    async fn test_second_request_is_a_cache_hit() {
        let fx = fixture(8);
        let descriptor = write(&fx, "hello.js");

        let first = fx.registry.get_or_build(&descriptor).await.unwrap();
        let second = fx.registry.get_or_build(&descriptor).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.registry.builds(), 1);
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(first.descriptor.kind, FunctionKind::Script);
    }

    #[tokio::test]
    async fn test_changed_mod_time_rebuilds_and_evicts_old_artifact() {
        let fx = fixture(8);
        let descriptor = write(&fx, "hello.js");
        let first = fx.registry.get_or_build(&descriptor).await.unwrap();
        let old_dir = first.artifact_dir.to_path_buf();
        drop(first);

        let mut newer = descriptor.clone();
        newer.source_mod_time += Duration::from_secs(10);
        let second = fx.registry.get_or_build(&newer).await.unwrap();

        assert_eq!(fx.registry.builds(), 2);
        assert!(!old_dir.exists());
        assert!(second.artifact_dir.exists());
        assert_ne!(second.artifact_dir.path(), old_dir);
    }

    #[tokio::test]
    async fn test_rebuild_keeps_artifact_held_by_request() {
        let fx = fixture(8);
        let descriptor = write(&fx, "hello.js");
        let held = fx.registry.get_or_build(&descriptor).await.unwrap();
        let held_bundle = held.artifact_path().to_path_buf();

        let mut newer = descriptor.clone();
        newer.source_mod_time += Duration::from_secs(10);
        let rebuilt = fx.registry.get_or_build(&newer).await.unwrap();

        assert_eq!(fx.registry.builds(), 2);
        assert!(!Arc::ptr_eq(&held, &rebuilt));
        assert!(held_bundle.is_file());
        assert!(rebuilt.artifact_path().is_file());

        let held_dir = held.artifact_dir.to_path_buf();
        drop(held);
        assert!(!held_dir.exists());
        assert!(rebuilt.artifact_dir.exists());
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_build_once() {
        let fx = fixture(8);
        let descriptor = write(&fx, "hello.js");

        let results = futures::future::join_all(
            (0..8).map(|_| fx.registry.get_or_build(&descriptor)),
        )
        .await;

        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(fx.registry.builds(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let fx = fixture(8);
        let descriptor = write(&fx, "hello.js");
        let mut missing = descriptor.clone();
        missing.source_path = fx.functions.path().join("gone.js");

        assert!(fx.registry.get_or_build(&missing).await.is_err());
        assert!(fx.registry.cached(&missing.source_path).is_none());
        assert_eq!(fx.registry.len(), 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let fx = fixture(2);
        let a = write(&fx, "a.js");
        let b = write(&fx, "b.js");
        let c = write(&fx, "c.js");

        let a_dir = fx
            .registry
            .get_or_build(&a)
            .await
            .unwrap()
            .artifact_dir
            .to_path_buf();
        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.registry.get_or_build(&b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.registry.get_or_build(&c).await.unwrap();

        assert_eq!(fx.registry.len(), 2);
        assert!(fx.registry.cached(&a.source_path).is_none());
        assert!(fx.registry.cached(&b.source_path).is_some());
        assert!(fx.registry.cached(&c.source_path).is_some());
        assert!(!a_dir.exists());
    }

    #[tokio::test]
    async fn test_in_use_entries_survive_eviction() {
        let fx = fixture(8);
        let a = write(&fx, "a.js");
        let held = fx.registry.get_or_build(&a).await.unwrap();

        assert_eq!(fx.registry.evict_idle(Duration::ZERO), 0);
        assert!(held.artifact_dir.exists());

        drop(held);
        assert_eq!(fx.registry.evict_idle(Duration::ZERO), 1);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_evict_idle_respects_ttl() {
        let fx = fixture(8);
        let a = write(&fx, "a.js");
        fx.registry.get_or_build(&a).await.unwrap();

        assert_eq!(fx.registry.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let fx = fixture(8);
        let a = write(&fx, "a.js");
        let dir = fx
            .registry
            .get_or_build(&a)
            .await
            .unwrap()
            .artifact_dir
            .to_path_buf();

        assert_eq!(fx.registry.clear(), 1);
        assert!(fx.registry.is_empty());
        assert!(!dir.exists());
    }
}
