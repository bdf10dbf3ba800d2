// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Script bundling.
//!
//! Script sources are bundled with their dependencies into one minified
//! CommonJS file that the runtime bootstrap can `require()` directly.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, error};

use crate::builder::BuildOptions;
use crate::descriptor::FunctionDescriptor;
use crate::error::BuildError;
use crate::process::{run_tool, tool_name};

/// File name of the bundle inside its artifact directory.
pub const BUNDLE_FILE_NAME: &str = "bundle.js";

/// Bundle `descriptor` into `artifact_dir`, returning the bundle path.
pub(crate) async fn bundle_script(
    descriptor: &FunctionDescriptor,
    artifact_dir: &Path,
    options: &BuildOptions,
) -> Result<PathBuf, BuildError> {
    // The bundler runs in the build directory, so relative paths would not resolve.
    let source = std::path::absolute(&descriptor.source_path)?;
    let output_path = std::path::absolute(artifact_dir.join(BUNDLE_FILE_NAME))?;
    let bundler = &options.toolchain.bundler;
    let tool = tool_name(bundler);

    let mut cmd = Command::new(bundler);
    cmd.current_dir(&options.build_dir)
        .arg(&source)
        .args(bundler_flags())
        .arg(format!("--outfile={}", output_path.display()));

    debug!(
        route = %descriptor.route,
        source = %source.display(),
        output = %output_path.display(),
        build_dir = %options.build_dir.display(),
        "Bundling script function"
    );

    let output = run_tool(cmd, &tool, options.timeout).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            route = %descriptor.route,
            exit_code = ?output.status.code(),
            stderr = %stderr,
            "Bundler failed"
        );
        let message = stderr.trim();
        return Err(BuildError::Bundler(if message.is_empty() {
            format!("{} exited with {}", tool, output.status)
        } else {
            message.to_string()
        }));
    }

    if !output_path.is_file() {
        return Err(BuildError::MissingArtifact(output_path));
    }

    Ok(output_path)
}

/// Flags passed to the bundler after the entry point.
pub fn bundler_flags() -> [&'static str; 6] {
    [
        "--bundle",
        "--minify-whitespace",
        "--minify-syntax",
        "--platform=node",
        "--format=cjs",
        "--log-level=error",
    ]
}
