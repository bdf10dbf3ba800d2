// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for build pipeline tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use funcgate_build::{BuildOptions, Toolchain};

/// Marker that makes the fake bundler fail like a syntax error would.
pub const SYNTAX_ERROR_MARKER: &str = "SYNTAX_ERROR";

/// Stand-in for esbuild: copies the entry to `--outfile`, or fails with a
/// diagnostic when the entry contains [`SYNTAX_ERROR_MARKER`].
const FAKE_BUNDLER: &str = r#"#!/bin/sh
entry="$1"
shift
out=""
for arg in "$@"; do
  case "$arg" in
    --outfile=*) out="${arg#--outfile=}" ;;
  esac
done
if grep -q SYNTAX_ERROR "$entry"; then
  echo "✘ [ERROR] Unexpected \"SYNTAX_ERROR\" in $entry" >&2
  exit 1
fi
cp "$entry" "$out"
"#;

/// Write an executable shell script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Install the fake bundler into `dir`.
pub fn fake_bundler(dir: &Path) -> PathBuf {
    write_script(dir, "fake-esbuild", FAKE_BUNDLER)
}

/// Build options using the fake bundler and the system rustc.
pub fn test_options(build_dir: &Path, tools_dir: &Path) -> BuildOptions {
    let mut options = BuildOptions::new(build_dir);
    options.toolchain = Toolchain {
        bundler: fake_bundler(tools_dir),
        ..Toolchain::default()
    };
    options
}

/// Write `contents` to `root/rel`, creating parent directories.
pub fn write_source(root: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    path
}

/// Native module that answers `ok <path>` as text/plain.
pub const NATIVE_OK: &str = r#"
use std::ffi::c_void;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Str { ptr: *const u8, len: usize }

#[repr(C)]
pub struct Header { name: Str, value: Str }

#[repr(C)]
pub struct Request {
    method: Str,
    path: Str,
    query: Str,
    headers: *const Header,
    headers_len: usize,
    body: Str,
}

#[repr(C)]
pub struct ResponseSink {
    context: *mut c_void,
    set_status: extern "C" fn(*mut c_void, u16),
    set_header: extern "C" fn(*mut c_void, Str, Str),
    write: extern "C" fn(*mut c_void, Str),
}

fn s(bytes: &[u8]) -> Str {
    Str { ptr: bytes.as_ptr(), len: bytes.len() }
}

#[no_mangle]
pub static HANDLER_SIGNATURE: [u8; 40] = *b"fn(*const ResponseSink, *const Request)\0";

#[no_mangle]
pub extern "C" fn Handler(sink: *const ResponseSink, request: *const Request) {
    let sink = unsafe { &*sink };
    let request = unsafe { &*request };
    (sink.set_status)(sink.context, 200);
    (sink.set_header)(sink.context, s(b"content-type"), s(b"text/plain"));
    (sink.write)(sink.context, s(b"ok "));
    (sink.write)(sink.context, request.path);
}
"#;

/// Handler with some other shape and no signature tag.
pub const NATIVE_WRONG_SIGNATURE: &str = r#"
#[no_mangle]
pub extern "C" fn Handler(code: i32) -> i32 {
    code + 1
}
"#;

/// Handler declaring a different signature tag.
pub const NATIVE_MISMATCHED_TAG: &str = r#"
#[no_mangle]
pub static HANDLER_SIGNATURE: [u8; 13] = *b"fn(i32)->i32\0";

#[no_mangle]
pub extern "C" fn Handler(code: i32) -> i32 {
    code + 1
}
"#;

/// Correct tag, but no handler.
pub const NATIVE_MISSING_HANDLER: &str = r#"
#[no_mangle]
pub static HANDLER_SIGNATURE: [u8; 40] = *b"fn(*const ResponseSink, *const Request)\0";

#[no_mangle]
pub extern "C" fn handle(code: i32) -> i32 {
    code
}
"#;

/// Does not compile.
pub const NATIVE_BROKEN: &str = r#"
pub fn broken( {
"#;
