// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide scratch directory for build artifacts and bootstrap files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempDir;
use tracing::info;

/// Temporary directory owned by the gateway for its whole lifetime.
///
/// Created once at startup and removed once at shutdown. `remove` is
/// idempotent, and dropping the value removes the directory if `remove`
/// was never called.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
}

impl ScratchDir {
    /// Create a fresh scratch directory in the system temp location.
    pub fn new() -> io::Result<Self> {
        Self::wrap(tempfile::Builder::new().prefix("funcgate-").tempdir()?)
    }

    /// Create a fresh scratch directory inside `parent`.
    pub fn new_in(parent: &Path) -> io::Result<Self> {
        Self::wrap(tempfile::Builder::new().prefix("funcgate-").tempdir_in(parent)?)
    }

    fn wrap(dir: TempDir) -> io::Result<Self> {
        let path = dir.path().to_path_buf();
        info!(path = %path.display(), "Created scratch directory");
        Ok(Self {
            path,
            dir: Mutex::new(Some(dir)),
        })
    }

    /// Location of the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the directory and everything in it. Later calls do nothing.
    pub fn remove(&self) -> io::Result<()> {
        let dir = match self.dir.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match dir {
            Some(dir) => {
                dir.close()?;
                info!(path = %self.path.display(), "Removed scratch directory");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Whether `remove` has not run yet.
    pub fn is_present(&self) -> bool {
        match self.dir.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_dir_lifecycle() {
        let parent = TempDir::new().unwrap();
        let scratch = ScratchDir::new_in(parent.path()).unwrap();
        let path = scratch.path().to_path_buf();

        assert!(path.is_dir());
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("funcgate-")
        );
        std::fs::write(path.join("artifact.js"), "x").unwrap();

        scratch.remove().unwrap();
        assert!(!path.exists());
        assert!(!scratch.is_present());

        // Second removal is a no-op.
        scratch.remove().unwrap();
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let parent = TempDir::new().unwrap();
        let scratch = ScratchDir::new_in(parent.path()).unwrap();
        let path = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!path.exists());
    }
}
