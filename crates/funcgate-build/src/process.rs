// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded execution of external build tools.

use std::io::ErrorKind;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

use crate::error::BuildError;

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// The child is also killed when the returned future is dropped, so a
/// cancelled request never leaves a build tool behind.
pub(crate) async fn run_tool(
    mut cmd: Command,
    tool: &str,
    timeout: Duration,
) -> Result<Output, BuildError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => BuildError::ToolNotFound(tool.to_string()),
        _ => BuildError::Spawn {
            tool: tool.to_string(),
            source: e,
        },
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(BuildError::Timeout {
            tool: tool.to_string(),
            after: timeout,
        }),
    }
}

/// Display name for a tool path (`/usr/bin/esbuild` → `esbuild`).
pub(crate) fn tool_name(program: &std::path::Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}
