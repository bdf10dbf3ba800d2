// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build entry point: descriptor in, executable artifact out.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::bundle::bundle_script;
use crate::descriptor::{FunctionDescriptor, FunctionKind};
use crate::error::BuildError;
use crate::native::{NativeModule, compile_native};

/// Default bound on a single build.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(120);

/// External tools used by the build strategies.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Script bundler executable.
    pub bundler: PathBuf,
    /// Rust compiler executable.
    pub rustc: PathBuf,
    /// `-C opt-level` for native modules.
    pub native_opt_level: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            bundler: PathBuf::from("esbuild"),
            rustc: PathBuf::from("rustc"),
            native_opt_level: "0".to_string(),
        }
    }
}

/// Options shared by every build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Working directory for the bundler (where `node_modules` lives).
    pub build_dir: PathBuf,
    /// Tools to invoke.
    pub toolchain: Toolchain,
    /// Bound on a single build.
    pub timeout: Duration,
}

impl BuildOptions {
    /// Options with the default toolchain and timeout.
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            toolchain: Toolchain::default(),
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }
}

/// Executable form of a built function.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Single-file script bundle, executed by a runtime process.
    Bundle {
        /// Bundle location.
        path: PathBuf,
    },
    /// Loaded shared library, invoked in-process.
    Native(Arc<NativeModule>),
}

impl Artifact {
    /// Artifact location on disk.
    pub fn path(&self) -> &Path {
        match self {
            Artifact::Bundle { path } => path,
            Artifact::Native(module) => module.path(),
        }
    }
}

/// Per-build directory, removed from disk when dropped.
///
/// A [`BuiltFunction`] owns its directory, so the files stay in place for as
/// long as any request still holds the build, and a build abandoned halfway
/// leaves nothing behind.
#[derive(Debug)]
pub struct ArtifactDir {
    path: PathBuf,
}

impl ArtifactDir {
    /// Take ownership of an existing directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Directory location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for ArtifactDir {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for ArtifactDir {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArtifactDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed artifact directory"),
            // Already gone with the whole scratch directory.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove artifact directory"
            ),
        }
    }
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuiltFunction {
    /// Descriptor the artifact was built from.
    pub descriptor: FunctionDescriptor,
    /// The executable artifact.
    pub artifact: Artifact,
    /// Per-build directory owning every file of this build.
    pub artifact_dir: ArtifactDir,
    /// Artifact size in bytes.
    pub artifact_size: u64,
    /// SHA-256 of the artifact, hex encoded.
    pub artifact_checksum: String,
    /// Wall-clock build time.
    pub build_duration: Duration,
}

impl BuiltFunction {
    /// Artifact location on disk.
    pub fn artifact_path(&self) -> &Path {
        self.artifact.path()
    }
}

/// Builds function sources into artifacts under a scratch directory.
#[derive(Debug, Clone)]
pub struct Builder {
    options: BuildOptions,
}

impl Builder {
    /// Create a builder.
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    /// Options in use.
    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build `descriptor` into a fresh directory under `scratch_dir`.
    ///
    /// On failure, or when the returned future is dropped before it
    /// completes, the per-build directory is removed again.
    pub async fn build(
        &self,
        descriptor: &FunctionDescriptor,
        scratch_dir: &Path,
    ) -> Result<BuiltFunction, BuildError> {
        if !descriptor.kind.is_supported() {
            let ext = descriptor
                .source_path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(BuildError::Unsupported(ext));
        }

        let started = Instant::now();
        let artifact_dir = create_artifact_dir(scratch_dir, descriptor)?;

        let result = self.build_into(descriptor, &artifact_dir).await;
        let (artifact, artifact_size, artifact_checksum) = match result {
            Ok(built) => built,
            Err(e) => {
                error!(
                    route = %descriptor.route,
                    kind = %descriptor.kind,
                    error = %e,
                    "Function build failed"
                );
                return Err(e);
            }
        };

        let build_duration = started.elapsed();
        info!(
            route = %descriptor.route,
            kind = %descriptor.kind,
            artifact = %artifact.path().display(),
            artifact_size = artifact_size,
            artifact_checksum = %artifact_checksum,
            build_duration_ms = build_duration.as_millis() as u64,
            "Function built"
        );

        Ok(BuiltFunction {
            descriptor: descriptor.clone(),
            artifact,
            artifact_dir,
            artifact_size,
            artifact_checksum,
            build_duration,
        })
    }

    async fn build_into(
        &self,
        descriptor: &FunctionDescriptor,
        artifact_dir: &Path,
    ) -> Result<(Artifact, u64, String), BuildError> {
        match descriptor.kind {
            FunctionKind::Script => {
                let path = bundle_script(descriptor, artifact_dir, &self.options).await?;
                let (size, checksum) = checksum_blocking(path.clone()).await?;
                Ok((Artifact::Bundle { path }, size, checksum))
            }
            FunctionKind::Native => {
                let path = compile_native(descriptor, artifact_dir, &self.options).await?;
                let (size, checksum) = checksum_blocking(path.clone()).await?;
                let module = tokio::task::spawn_blocking(move || NativeModule::load(&path))
                    .await
                    .map_err(|e| BuildError::Io(io::Error::other(e)))??;
                Ok((Artifact::Native(Arc::new(module)), size, checksum))
            }
            FunctionKind::Unsupported => Err(BuildError::Unsupported(String::new())),
        }
    }
}

/// Create `<scratch>/<base-dir>/<stem>-XXXXXX/` for one build.
pub fn create_artifact_dir(
    scratch_dir: &Path,
    descriptor: &FunctionDescriptor,
) -> io::Result<ArtifactDir> {
    let namespace = scratch_dir.join(descriptor.base_dir.trim_start_matches('/'));
    fs::create_dir_all(&namespace)?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{}-", descriptor.file_stem()))
        .tempdir_in(&namespace)?;
    Ok(ArtifactDir::new(dir.keep()))
}

async fn checksum_blocking(path: PathBuf) -> Result<(u64, String), BuildError> {
    tokio::task::spawn_blocking(move || checksum_file(&path))
        .await
        .map_err(|e| BuildError::Io(io::Error::other(e)))?
        .map_err(BuildError::from)
}

/// Size and hex SHA-256 of a file, read in chunks.
pub fn checksum_file(path: &Path) -> io::Result<(u64, String)> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok((size, format!("{:x}", hasher.finalize())))
}
