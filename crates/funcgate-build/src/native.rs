// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native function modules: compile a single Rust source into a shared
//! library, then load it and look up its handler.

use std::fmt;
use std::path::{Path, PathBuf};

use libloading::Library;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::abi::{
    HANDLER_SIGNATURE, HANDLER_SYMBOL, HandlerFn, NativeRequest, NativeResponse, SIGNATURE_SYMBOL,
    call_handler,
};
use crate::builder::BuildOptions;
use crate::descriptor::FunctionDescriptor;
use crate::error::BuildError;
use crate::process::{run_tool, tool_name};

// ============================================================================
// Rustc Error Parsing
// ============================================================================

/// Condense rustc stderr into a short message for the HTTP response.
fn parse_rustc_error(stderr: &str) -> String {
    // Function sources are compiled standalone; only std is available.
    if stderr.contains("can't find crate for")
        && let Some(crate_name) = extract_pattern(stderr, "can't find crate for `", "`")
    {
        return format!(
            "Compilation failed: crate '{}' is not available.\n\n\
             Native functions are compiled as a single file against std only.",
            crate_name
        );
    }

    if stderr.contains("error[E0432]")
        && let Some(import) = extract_pattern(stderr, "unresolved import `", "`")
    {
        return format!("Compilation failed: unresolved import '{}'.", import);
    }

    if let Some(first_error) = extract_first_error(stderr) {
        return match extract_location(stderr) {
            Some(location) => format!("Compilation failed: {}\n  --> {}", first_error, location),
            None => format!("Compilation failed: {}", first_error),
        };
    }

    "Compilation failed.".to_string()
}

/// Extract a pattern from text: prefix...suffix
fn extract_pattern<'a>(text: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let start = text.find(prefix)? + prefix.len();
    let rest = &text[start..];
    let end = rest.find(suffix)?;
    Some(&rest[..end])
}

/// Extract the first error message from rustc output.
fn extract_first_error(stderr: &str) -> Option<String> {
    for line in stderr.lines() {
        let line = line.trim();
        if line.starts_with("error[E") {
            if let Some(msg_start) = line.find("]: ") {
                return Some(line[msg_start + 3..].to_string());
            }
        } else if line.starts_with("error:") {
            let msg = line.trim_start_matches("error:").trim();
            if !msg.is_empty() && !msg.starts_with("aborting due to") {
                return Some(msg.to_string());
            }
        }
    }
    None
}

/// First `--> file:line:col` marker, if any.
fn extract_location(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("--> "))
        .map(str::to_string)
}

/// Turn a file stem into a valid crate name.
fn sanitize_crate_name(stem: &str) -> String {
    let mut name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "fn_");
    }
    name
}

// ============================================================================
// Compilation
// ============================================================================

/// Compile `descriptor` into a shared library inside `artifact_dir`.
pub(crate) async fn compile_native(
    descriptor: &FunctionDescriptor,
    artifact_dir: &Path,
    options: &BuildOptions,
) -> Result<PathBuf, BuildError> {
    let crate_name = sanitize_crate_name(descriptor.file_stem());
    // rustc runs in the source directory, so relative paths would not resolve.
    let source = std::path::absolute(&descriptor.source_path)?;
    let output_path = std::path::absolute(artifact_dir.join(format!(
        "{}{}.{}",
        std::env::consts::DLL_PREFIX,
        crate_name,
        std::env::consts::DLL_EXTENSION
    )))?;
    let rustc = &options.toolchain.rustc;

    let mut cmd = Command::new(rustc);
    cmd.current_dir(source.parent().unwrap_or(&options.build_dir))
        .env_remove("RUSTFLAGS")
        .arg("--crate-type=cdylib")
        .arg(format!("--crate-name={}", crate_name))
        .arg("--edition=2021")
        .arg("-C")
        .arg(format!("opt-level={}", options.toolchain.native_opt_level))
        .arg("-o")
        .arg(&output_path)
        .arg(&source);

    debug!(
        route = %descriptor.route,
        source = %source.display(),
        output = %output_path.display(),
        crate_name = %crate_name,
        "Compiling native function"
    );

    let output = run_tool(cmd, &tool_name(rustc), options.timeout).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            route = %descriptor.route,
            exit_code = ?output.status.code(),
            stderr = %stderr,
            "rustc compilation failed"
        );
        return Err(BuildError::Compiler(parse_rustc_error(&stderr)));
    }

    if !output_path.is_file() {
        return Err(BuildError::MissingArtifact(output_path));
    }

    Ok(output_path)
}

// ============================================================================
// Loading
// ============================================================================

/// A loaded native function module.
pub struct NativeModule {
    handler: HandlerFn,
    path: PathBuf,
    // Keeps the code behind `handler` mapped; must drop last.
    _library: Library,
}

impl NativeModule {
    /// Load the shared library at `path` and resolve its handler.
    ///
    /// The signature tag is verified before `Handler` is looked up.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        // SAFETY: loading runs the library's initialisers. Modules are built by
        // this process from sources under the served functions directory.
        let library = unsafe { Library::new(path) }.map_err(|e| BuildError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        verify_signature(&library)?;

        // SAFETY: the signature tag declares this exact function type.
        let handler: HandlerFn = unsafe { library.get::<HandlerFn>(HANDLER_SYMBOL) }
            .map(|symbol| *symbol)
            .map_err(|e| BuildError::MissingSymbol {
                symbol: "Handler",
                message: e.to_string(),
            })?;

        info!(path = %path.display(), "Loaded native function module");

        Ok(Self {
            handler,
            path: path.to_path_buf(),
            _library: library,
        })
    }

    /// Invoke the handler. Blocks for as long as the handler runs.
    pub fn invoke(&self, request: &NativeRequest) -> NativeResponse {
        // SAFETY: `handler` was resolved from `_library`, which is still loaded,
        // and its signature tag matched.
        unsafe { call_handler(self.handler, request) }
    }

    /// Path of the loaded library.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn verify_signature(library: &Library) -> Result<(), BuildError> {
    let expected = String::from_utf8_lossy(HANDLER_SIGNATURE).into_owned();

    // SAFETY: the symbol is read as a data address only; it is never called.
    let tag = unsafe { library.get::<*const u8>(SIGNATURE_SYMBOL) }
        .map(|symbol| *symbol)
        .map_err(|_| BuildError::SignatureMismatch {
            expected: expected.clone(),
            found: "nothing".to_string(),
        })?;

    if tag.is_null() {
        return Err(BuildError::SignatureMismatch {
            expected,
            found: "nothing".to_string(),
        });
    }

    // Compare byte by byte and stop at the first difference or NUL, so a
    // shorter tag is never read past its end.
    let mut declared = Vec::with_capacity(HANDLER_SIGNATURE.len());
    let mut matches = true;
    for (i, want) in HANDLER_SIGNATURE.iter().enumerate() {
        // SAFETY: every byte before this one was non-NUL, so the tag extends here.
        let got = unsafe { *tag.add(i) };
        if got == 0 {
            matches = false;
            break;
        }
        declared.push(got);
        if got != *want {
            matches = false;
            break;
        }
    }
    // SAFETY: all bytes up to here matched the non-NUL expected signature.
    if matches && unsafe { *tag.add(HANDLER_SIGNATURE.len()) } == 0 {
        return Ok(());
    }

    let found = if declared.is_empty() {
        "nothing".to_string()
    } else {
        format!("`{}...`", String::from_utf8_lossy(&declared))
    };
    Err(BuildError::SignatureMismatch { expected, found })
}
