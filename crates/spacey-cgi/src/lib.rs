// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # spacey-cgi
//!
//! An embeddable CGI/FastCGI scripting host for Spacey-compatible engines.
//!
//! Each request gets a scripting environment with:
//!
//! - A CommonJS-style module system (`require()` / `include()`)
//! - Script modules (`.script`) and native plugins (shared libraries)
//! - An artifact cache that survives across requests until files change
//! - `onexit()` callbacks and deterministic native-resource finalization
//! - Optional context reuse for long-lived FastCGI workers
//!
//! The engine itself is supplied by the embedder through the [`Engine`] trait.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use spacey_cgi::{CgiRuntime, HostConfig, Request, StdIo};
//!
//! let mut runtime = CgiRuntime::new(HostConfig::from_env(), MyEngine::new);
//! let request = Request::new()
//!     .with_main_file("/srv/www/index.script")
//!     .with_env("SERVER_SOFTWARE", "spacey");
//! let status = runtime.execute(&request, &mut StdIo);
//! std::process::exit(status);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod finalization;
pub mod module_system;
pub mod request;
pub mod runtime;

#[cfg(test)]
mod testing;

// Re-exports
pub use config::HostConfig;
pub use engine::{Engine, NativeFunction, ScriptError, ScriptErrorKind};
pub use error::{CgiError, Result};
pub use finalization::FinalizationBridge;
pub use request::{BufferedIo, Request, RequestIo, StdIo};
pub use runtime::{CgiRuntime, ExecutionContext};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
