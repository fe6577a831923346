// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Native plugin primitives (open / symbol lookup / close)

use std::ffi::c_void;
use std::path::Path;

/// Symbol every native plugin must export
pub const PLUGIN_INIT_SYMBOL: &str = "spacey_module_init";

/// An opened shared library
pub trait PluginLibrary {
    /// Address of an exported symbol, if present
    fn symbol(&self, name: &str) -> Option<*const c_void>;

    /// Close the library
    fn close(self: Box<Self>) -> Result<(), String>;
}

/// Opens shared libraries
pub trait LibraryLoader {
    /// Open the library at `path`
    fn open(&self, path: &Path) -> Result<Box<dyn PluginLibrary>, String>;
}

/// Loader backed by the platform's dynamic linker
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl LibraryLoader for NativeLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn PluginLibrary>, String> {
        // SAFETY: running a library's initializers is inherent to loading
        // plugins; modules run with full native privilege once loaded.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| e.to_string())?;
        Ok(Box::new(NativeLibrary { library }))
    }
}

struct NativeLibrary {
    library: libloading::Library,
}

impl PluginLibrary for NativeLibrary {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: the address is only handed to the engine, which knows the
        // plugin calling convention; nothing is called here.
        let symbol = unsafe { self.library.get::<*const c_void>(name.as_bytes()) }.ok()?;
        Some(*symbol)
    }

    fn close(self: Box<Self>) -> Result<(), String> {
        self.library.close().map_err(|e| e.to_string())
    }
}
