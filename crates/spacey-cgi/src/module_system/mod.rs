// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! CommonJS-style module system
//!
//! ## Resolution
//! - Absolute specifiers are normalized and probed
//! - `./` and `../` specifiers resolve against the running module's directory
//! - Bare specifiers are looked up in the search paths, first hit wins
//! - Probing tries the path as-is, then `.script`, then the platform library
//!   extension
//!
//! ## Caching
//! - Source, compiled bodies and library handles persist across requests
//!   until the file's modification time changes
//! - Exports objects live for one request

mod cache;
mod loader;
pub mod plugin;
mod resolver;

pub use cache::{ArtifactCache, CacheRecord};
pub use loader::ModuleLoader;
pub use plugin::{LibraryLoader, NativeLoader, PluginLibrary, PLUGIN_INIT_SYMBOL};
pub use resolver::{normalize, ModuleKind, ModuleResolver, PathStack, SCRIPT_EXTENSION};
