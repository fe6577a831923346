// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module loader - require() and include()

use crate::engine::Engine;
use crate::error::{CgiError, Result};
use crate::module_system::cache::ArtifactCache;
use crate::module_system::plugin::PLUGIN_INIT_SYMBOL;
use crate::module_system::resolver::{ModuleKind, ModuleResolver, PathStack};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Module loader of one execution context.
///
/// Engine calls re-enter the loader through the `require` binding, so no
/// `RefCell` borrow is ever held across a call into the engine.
pub struct ModuleLoader<E: Engine> {
    /// Module resolver
    resolver: ModuleResolver,
    /// Artifact cache, shared with every other context of the process
    cache: Rc<RefCell<ArtifactCache<E>>>,
    /// Directories of the modules currently executing
    paths: RefCell<PathStack>,
    /// Explicit per-context search paths
    search_paths: RefCell<Vec<PathBuf>>,
    /// Library directory used when no explicit search paths are set
    default_library: RefCell<Option<PathBuf>>,
}

impl<E: Engine> ModuleLoader<E> {
    /// Create a loader on top of a shared cache
    pub fn new(resolver: ModuleResolver, cache: Rc<RefCell<ArtifactCache<E>>>) -> Self {
        Self {
            resolver,
            cache,
            paths: RefCell::new(PathStack::new()),
            search_paths: RefCell::new(Vec::new()),
            default_library: RefCell::new(None),
        }
    }

    /// Replace the explicit search-path list.
    ///
    /// A non-empty list replaces the default library directory entirely.
    pub fn set_search_paths(&self, paths: Vec<PathBuf>) {
        *self.search_paths.borrow_mut() = paths;
    }

    /// Set the default library directory
    pub fn set_default_library(&self, dir: Option<PathBuf>) {
        *self.default_library.borrow_mut() = dir;
    }

    /// Directories bare specifiers are looked up in, in order
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let explicit = self.search_paths.borrow();
        if !explicit.is_empty() {
            return explicit.clone();
        }
        self.default_library.borrow().iter().cloned().collect()
    }

    /// The shared artifact cache
    pub fn cache(&self) -> &Rc<RefCell<ArtifactCache<E>>> {
        &self.cache
    }

    /// Number of modules currently executing
    pub fn depth(&self) -> usize {
        self.paths.borrow().len()
    }

    /// Drain the path stack
    pub fn clear_paths(&self) {
        self.paths.borrow_mut().clear();
    }

    /// Resolve a specifier against the running module and the search paths
    pub fn resolve(&self, specifier: &str) -> Result<PathBuf> {
        let search_paths = self.search_paths();
        let paths = self.paths.borrow();
        self.resolver
            .resolve(specifier, &paths, &search_paths)
            .ok_or_else(|| CgiError::module_not_found(specifier))
    }

    /// Load a module and return its exports.
    ///
    /// A module runs at most once per request; later requires of the same
    /// path, including circular ones, get the memoized exports object.
    pub fn require(&self, engine: &mut E, specifier: &str) -> Result<E::Value> {
        let path = self.resolve(specifier)?;

        let memoized = self.cache.borrow().get_exports(&path);
        if let Some(exports) = memoized {
            tracing::trace!("require('{}'): memoized {}", specifier, path.display());
            return Ok(exports);
        }

        self.load(engine, &path)
    }

    /// Require a module and copy its exports onto the global object
    pub fn include(&self, engine: &mut E, specifier: &str) -> Result<E::Value> {
        let exports = self.require(engine, specifier)?;
        let global = engine.global();
        for key in engine.keys(&exports)? {
            if let Some(value) = engine.get(&exports, &key)? {
                engine.set(&global, &key, value)?;
            }
        }
        Ok(exports)
    }

    fn load(&self, engine: &mut E, path: &Path) -> Result<E::Value> {
        tracing::debug!("Loading module {}", path.display());

        let module = module_descriptor(engine, path)?;
        let exports = engine.new_object();
        self.cache
            .borrow_mut()
            .set_exports(path.to_path_buf(), exports.clone());

        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        self.paths.borrow_mut().push(dir);

        let result = match self.resolver.kind(path) {
            ModuleKind::Script => self.run_script(engine, path, &exports, &module),
            ModuleKind::Plugin => self
                .init_plugin(engine, path, &exports, &module)
                .map(|()| exports),
        };

        self.paths.borrow_mut().pop();
        if result.is_err() {
            self.cache.borrow_mut().clear_exports(path);
        }
        result
    }

    fn run_script(
        &self,
        engine: &mut E,
        path: &Path,
        exports: &E::Value,
        module: &E::Value,
    ) -> Result<E::Value> {
        let script = self.cache.borrow_mut().get_compiled(engine, path)?;
        let body = engine.run(&script)?;
        let receiver = engine.undefined();
        let produced = engine.call(&body, &receiver, &[exports.clone(), module.clone()])?;

        if engine.is_undefined(&produced) {
            return Ok(exports.clone());
        }
        // A replacement value becomes the module's exports for later requires.
        self.cache
            .borrow_mut()
            .set_exports(path.to_path_buf(), produced.clone());
        Ok(produced)
    }

    fn init_plugin(
        &self,
        engine: &mut E,
        path: &Path,
        exports: &E::Value,
        module: &E::Value,
    ) -> Result<()> {
        let entry = {
            let mut cache = self.cache.borrow_mut();
            cache
                .get_handle(path)?
                .symbol(PLUGIN_INIT_SYMBOL)
                .ok_or_else(|| CgiError::PluginInit {
                    path: path.to_path_buf(),
                    reason: format!("missing entry point '{}'", PLUGIN_INIT_SYMBOL),
                })?
        };

        // SAFETY: `entry` was exported under the plugin init symbol by a
        // library that stays cached (and open) until its file changes.
        let result = unsafe { engine.init_plugin(entry, exports, module) };
        result.map_err(|err| {
            if err.is_termination() {
                CgiError::Script(err)
            } else {
                CgiError::PluginInit {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                }
            }
        })
    }
}

/// `{ id, filename }` object handed to module bodies
fn module_descriptor<E: Engine>(engine: &mut E, path: &Path) -> Result<E::Value> {
    let descriptor = engine.new_object();
    let name = path.to_string_lossy();
    let id = engine.new_string(&name);
    let filename = engine.new_string(&name);
    engine.set(&descriptor, "id", id)?;
    engine.set(&descriptor, "filename", filename)?;
    Ok(descriptor)
}
