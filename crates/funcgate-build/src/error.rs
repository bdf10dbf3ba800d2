// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build error types.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while turning a function source into an executable artifact.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// No build strategy exists for the source extension.
    #[error("Unsupported function source: .{0}")]
    Unsupported(String),

    /// Build tool executable could not be found.
    #[error("Build tool not found: {0}")]
    ToolNotFound(String),

    /// Build tool could not be started.
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        /// Tool that failed to start.
        tool: String,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },

    /// Build tool did not finish in time and was killed.
    #[error("{tool} did not finish within {}s", .after.as_secs())]
    Timeout {
        /// Tool that timed out.
        tool: String,
        /// Configured bound.
        after: Duration,
    },

    /// Bundler rejected the source. Carries the bundler's own diagnostics.
    #[error("{0}")]
    Bundler(String),

    /// Native compilation failed. Carries a condensed compiler diagnostic.
    #[error("{0}")]
    Compiler(String),

    /// Tool reported success but the artifact is missing.
    #[error("Build produced no artifact at {}", .0.display())]
    MissingArtifact(PathBuf),

    /// Shared library could not be loaded.
    #[error("Failed to load native module {}: {message}", .path.display())]
    Load {
        /// Library path.
        path: PathBuf,
        /// Loader message.
        message: String,
    },

    /// Required symbol is not exported by the module.
    #[error("Native module does not export `{symbol}`: {message}")]
    MissingSymbol {
        /// Symbol name.
        symbol: &'static str,
        /// Loader message.
        message: String,
    },

    /// Module's handler signature tag is absent or does not match.
    #[error("Native handler signature mismatch: expected `{expected}`, found {found}")]
    SignatureMismatch {
        /// Required signature.
        expected: String,
        /// What the module declared, or `nothing`.
        found: String,
    },

    /// Filesystem error around the build.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BuildError {
    /// Whether the build was cut short by its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BuildError::Timeout { .. })
    }
}
