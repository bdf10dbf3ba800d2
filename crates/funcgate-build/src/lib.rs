// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Funcgate Build
//!
//! Resolves request paths to function source files and builds those sources
//! into something the gateway can execute.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   request path   ┌──────────────┐
//! │   Gateway    │ ───────────────► │   Resolver   │  walks the functions root
//! └──────┬───────┘                  └──────┬───────┘
//!        │                                 │ FunctionDescriptor
//!        │ build(descriptor, scratch)      ▼
//!        │                          ┌──────────────┐
//!        └────────────────────────► │   Builder    │
//!                                   └──────┬───────┘
//!                         ┌────────────────┴────────────────┐
//!                         ▼                                 ▼
//!                  .js / .ts                              .rs
//!              bundler → bundle.js             rustc → cdylib → dlopen
//!              Artifact::Bundle                Artifact::Native
//! ```
//!
//! ## Routes
//!
//! `hello.js` answers `/hello`, `users/list.rs` answers `/users/list`, and
//! `index.<ext>` answers its directory (`/`, `/users`). Lookups walk the
//! directory every time, in lexical order; the first match wins.
//!
//! ## Artifacts
//!
//! Every build gets its own directory `<scratch>/<base-dir>/<stem>-XXXXXX/`,
//! so evicting a stale build is a single `remove_dir_all`.
//!
//! Native modules speak the C ABI described in [`abi`].

#![deny(missing_docs)]

pub mod abi;
pub mod builder;
pub mod bundle;
pub mod descriptor;
pub mod error;
pub mod native;
mod process;
pub mod resolver;

pub use abi::{NativeRequest, NativeResponse};
pub use builder::{Artifact, ArtifactDir, BuildOptions, Builder, BuiltFunction, Toolchain};
pub use descriptor::{FunctionDescriptor, FunctionKind, normalize_request_path};
pub use error::BuildError;
pub use native::NativeModule;
pub use resolver::{DEFAULT_IGNORE, Resolver};
