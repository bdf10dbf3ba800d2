// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request path → function source resolution.
//!
//! The functions root is walked on every lookup so that added, removed and
//! edited files are picked up without a restart. Entries are visited in
//! lexical order per directory, depth first, and the first file whose derived
//! route equals the request path wins.

use std::fs::{self, DirEntry};
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::descriptor::{FunctionDescriptor, normalize_request_path, route_for};

/// Path fragments skipped by default during the walk.
pub const DEFAULT_IGNORE: &[&str] = &[
    "node_modules",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "go.mod",
    "go.sum",
    "Cargo.toml",
    "Cargo.lock",
];

/// Maps request paths onto function source files under a root directory.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
    ignore: Vec<String>,
}

impl Resolver {
    /// Create a resolver over `root` using the default ignore list.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_ignore(root, DEFAULT_IGNORE.iter().map(|s| s.to_string()))
    }

    /// Create a resolver with a custom ignore list.
    ///
    /// Each entry is matched as a substring of the path relative to the root.
    pub fn with_ignore<I, S>(root: impl Into<PathBuf>, ignore: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let root = root.into();
        Self {
            // Descriptor paths must stay valid from any working directory.
            root: std::path::absolute(&root).unwrap_or(root),
            ignore: ignore
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    /// Root directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the function answering `request_path`.
    ///
    /// A walk failure at the root is logged and reported as "no function",
    /// so the caller answers 404 instead of 500.
    pub fn resolve(&self, request_path: &str) -> Option<FunctionDescriptor> {
        let wanted = normalize_request_path(request_path);
        let mut found = None;

        let walked = self.walk(|descriptor| {
            if descriptor.route == wanted {
                found = Some(descriptor);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        if let Err(e) = walked {
            warn!(
                root = %self.root.display(),
                route = %wanted,
                error = %e,
                "Function directory walk failed"
            );
            return None;
        }

        if found.is_none() {
            debug!(route = %wanted, "No function source for route");
        }
        found
    }

    /// Every function source under the root, in walk order.
    pub fn discover(&self) -> io::Result<Vec<FunctionDescriptor>> {
        let mut all = Vec::new();
        self.walk(|descriptor| {
            all.push(descriptor);
            ControlFlow::Continue(())
        })?;
        Ok(all)
    }

    fn walk<F>(&self, mut visit: F) -> io::Result<()>
    where
        F: FnMut(FunctionDescriptor) -> ControlFlow<()>,
    {
        let entries = read_dir_sorted(&self.root)?;
        let _ = self.walk_entries(entries, &mut visit);
        Ok(())
    }

    fn walk_entries<F>(&self, entries: Vec<DirEntry>, visit: &mut F) -> ControlFlow<()>
    where
        F: FnMut(FunctionDescriptor) -> ControlFlow<()>,
    {
        for entry in entries {
            let path = entry.path();
            let relative = match path.strip_prefix(&self.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            if self.is_ignored(&relative) {
                continue;
            }

            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if file_type.is_dir() {
                match read_dir_sorted(&path) {
                    Ok(children) => self.walk_entries(children, visit)?,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable directory");
                    }
                }
                continue;
            }

            let Some(info) = route_for(&relative) else {
                continue;
            };

            // Follows symlinks, so a linked file reports its target's mtime.
            let modified = match fs::metadata(&path).and_then(|m| {
                if m.is_file() {
                    m.modified()
                } else {
                    Err(io::Error::other("not a regular file"))
                }
            }) {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping entry without usable metadata");
                    continue;
                }
            };

            visit(FunctionDescriptor {
                route: info.route,
                source_path: path,
                base_dir: info.base_dir,
                source_mod_time: modified,
                kind: info.kind,
            })?;
        }
        ControlFlow::Continue(())
    }

    fn is_ignored(&self, relative: &Path) -> bool {
        let rel = relative.to_string_lossy();
        self.ignore.iter().any(|pattern| rel.contains(pattern.as_str()))
    }
}

fn read_dir_sorted(dir: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}
