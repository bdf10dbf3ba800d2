// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function descriptors and route derivation.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Name of the file stem that maps onto its directory's route.
pub const INDEX_STEM: &str = "index";

/// Build/execution strategy selected from the source file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    /// Script source bundled into a single file and served by an ephemeral runtime process.
    Script,
    /// Compiled source loaded into the gateway as a shared library.
    Native,
    /// Any other extension. Resolves, but has no build strategy.
    Unsupported,
}

impl FunctionKind {
    /// Pick the strategy for a file extension (without the leading dot).
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "js" | "ts" => FunctionKind::Script,
            "rs" => FunctionKind::Native,
            _ => FunctionKind::Unsupported,
        }
    }

    /// Whether a build strategy exists for this kind.
    pub fn is_supported(self) -> bool {
        !matches!(self, FunctionKind::Unsupported)
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionKind::Script => write!(f, "script"),
            FunctionKind::Native => write!(f, "native"),
            FunctionKind::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// One resolved function source file.
///
/// Descriptors are produced fresh by the resolver on every request. The
/// gateway compares `source_mod_time` against its cached copy to decide
/// whether a rebuild is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    /// URL path this function answers to (`/`, `/hello`, `/users/list`).
    pub route: String,
    /// Absolute path of the source file.
    pub source_path: PathBuf,
    /// Route-style directory containing the source, relative to the functions root (`/`, `/users`).
    pub base_dir: String,
    /// Last modification time of the source file; the cache invalidation key.
    pub source_mod_time: SystemTime,
    /// Build strategy for this source.
    pub kind: FunctionKind,
}

impl FunctionDescriptor {
    /// File name of the source (`hello.js`).
    pub fn file_name(&self) -> &str {
        self.source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// File name without extension (`hello`).
    pub fn file_stem(&self) -> &str {
        self.source_path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// True when `other` describes the same file at a different modification time.
    pub fn is_stale_against(&self, other: &FunctionDescriptor) -> bool {
        self.source_path == other.source_path && self.source_mod_time != other.source_mod_time
    }
}

/// Route information derived from a path relative to the functions root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// URL path the file answers to.
    pub route: String,
    /// Route-style parent directory.
    pub base_dir: String,
    /// Strategy selected from the extension.
    pub kind: FunctionKind,
}

/// Compute the route for a file given its path relative to the functions root.
///
/// Returns `None` for files that cannot be functions: no extension, an empty
/// stem (dotfiles), or non UTF-8 names.
pub fn route_for(relative: &Path) -> Option<RouteInfo> {
    let stem = relative.file_stem()?.to_str()?;
    let ext = relative.extension()?.to_str()?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_str()?),
                Component::CurDir => {}
                _ => return None,
            }
        }
    }

    let base_dir = format!("/{}", segments.join("/"));
    let route = if stem == INDEX_STEM {
        base_dir.clone()
    } else if segments.is_empty() {
        format!("/{}", stem)
    } else {
        format!("{}/{}", base_dir, stem)
    };

    Some(RouteInfo {
        route,
        base_dir,
        kind: FunctionKind::from_extension(ext),
    })
}

/// Normalise an inbound URL path for route comparison.
///
/// Ensures a leading slash and strips trailing slashes, except for `/` itself.
pub fn normalize_request_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
