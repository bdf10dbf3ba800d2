// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup checks for the tools the functions on disk will need.
//!
//! Nothing here is fatal: a missing tool only matters once a function that
//! needs it is requested, and the build then reports the same problem.

use std::fmt;
use std::path::{Path, PathBuf};

use funcgate_build::{FunctionKind, Resolver};
use tracing::{info, warn};

use crate::config::GatewayConfig;

/// Something that will make some functions fail.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PreflightIssue {
    /// A tool is not on `PATH`.
    MissingTool {
        /// Function kind that needs the tool.
        kind: FunctionKind,
        /// Configured executable.
        tool: PathBuf,
    },
    /// Neither the build directory nor the working directory has a `package.json`.
    MissingPackageJson(PathBuf),
    /// The functions directory could not be scanned.
    Unreadable(PathBuf),
}

impl fmt::Display for PreflightIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreflightIssue::MissingTool { kind, tool } => {
                write!(f, "{} functions need `{}`, which is not on PATH", kind, tool.display())
            }
            PreflightIssue::MissingPackageJson(dir) => {
                write!(f, "no package.json in {}; run `npm init && npm i` to use script functions", dir.display())
            }
            PreflightIssue::Unreadable(dir) => {
                write!(f, "functions directory {} could not be read", dir.display())
            }
        }
    }
}

/// Check the environment against the functions under the configured root.
pub fn run(config: &GatewayConfig) -> Vec<PreflightIssue> {
    let resolver = Resolver::with_ignore(&config.functions_dir, config.ignore.iter().cloned());
    let functions = match resolver.discover() {
        Ok(functions) => functions,
        Err(e) => {
            warn!(
                functions_dir = %config.functions_dir.display(),
                error = %e,
                "Could not scan functions directory"
            );
            return vec![PreflightIssue::Unreadable(config.functions_dir.clone())];
        }
    };

    let scripts = functions
        .iter()
        .filter(|f| f.kind == FunctionKind::Script)
        .count();
    let natives = functions
        .iter()
        .filter(|f| f.kind == FunctionKind::Native)
        .count();
    info!(
        functions_dir = %config.functions_dir.display(),
        scripts,
        natives,
        "Discovered functions"
    );

    let mut issues = Vec::new();
    if scripts > 0 {
        for tool in [&config.script_runtime, &config.bundler] {
            check_tool(FunctionKind::Script, tool, &mut issues);
        }
        if !has_package_json(&config.build_dir) && !has_package_json(&config.working_dir) {
            issues.push(PreflightIssue::MissingPackageJson(config.build_dir.clone()));
        }
    }
    if natives > 0 {
        check_tool(FunctionKind::Native, &config.rustc, &mut issues);
    }

    for issue in &issues {
        warn!("{}", issue);
    }
    issues
}

fn check_tool(kind: FunctionKind, tool: &Path, issues: &mut Vec<PreflightIssue>) {
    if which::which(tool).is_err() {
        issues.push(PreflightIssue::MissingTool {
            kind,
            tool: tool.to_path_buf(),
        });
    }
}

fn has_package_json(dir: &Path) -> bool {
    dir.join("package.json").is_file()
}
