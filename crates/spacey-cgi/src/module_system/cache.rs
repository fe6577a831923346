// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Artifact cache for require()
//!
//! Source text, compiled scripts and shared library handles are cached per
//! resolved path and stay valid for as long as the file's modification time
//! is unchanged. Exports objects are cached separately and are wiped at the
//! end of every request.

use crate::engine::Engine;
use crate::error::{CgiError, Result};
use crate::module_system::plugin::{LibraryLoader, NativeLoader, PluginLibrary};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

/// Cached artifacts of one module file.
///
/// A record only exists once a modification time has been recorded for the
/// file. Dropping a record closes its shared library.
pub struct CacheRecord<E: Engine> {
    /// Modification time the artifacts were produced from
    modified: SystemTime,
    /// Source text with any interpreter line removed
    source: Option<Rc<str>>,
    /// Compiled module body
    compiled: Option<Rc<E::Script>>,
    /// Open shared library
    library: Option<Box<dyn PluginLibrary>>,
}

impl<E: Engine> CacheRecord<E> {
    fn new(modified: SystemTime) -> Self {
        Self {
            modified,
            source: None,
            compiled: None,
            library: None,
        }
    }
}

impl<E: Engine> Drop for CacheRecord<E> {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            if let Err(reason) = library.close() {
                tracing::warn!("Failed to close shared library: {}", reason);
            }
        }
    }
}

/// Per-process artifact cache
pub struct ArtifactCache<E: Engine> {
    /// Artifacts keyed by resolved module path
    records: HashMap<PathBuf, CacheRecord<E>>,
    /// Exports objects of the current request
    exports: HashMap<PathBuf, E::Value>,
    /// Opens native plugins
    loader: Box<dyn LibraryLoader>,
}

impl<E: Engine> ArtifactCache<E> {
    /// Create an empty cache using the platform dynamic linker
    pub fn new() -> Self {
        Self::with_loader(Box::new(NativeLoader))
    }

    /// Create an empty cache with a custom library loader
    pub fn with_loader(loader: Box<dyn LibraryLoader>) -> Self {
        Self {
            records: HashMap::new(),
            exports: HashMap::new(),
            loader,
        }
    }

    /// Check whether the cached artifacts for `path` are unusable.
    ///
    /// A file that cannot be stat'ed is always stale. A changed modification
    /// time evicts the record before reporting it stale.
    pub fn is_stale(&mut self, path: &Path) -> bool {
        let Some(modified) = file_modified(path) else {
            self.evict(path);
            return true;
        };

        match self.records.get(path) {
            None => true,
            Some(record) if record.modified != modified => {
                self.evict(path);
                true
            }
            Some(_) => false,
        }
    }

    /// Drop every artifact cached for `path`, closing its library first
    pub fn evict(&mut self, path: &Path) {
        if let Some(mut record) = self.records.remove(path) {
            tracing::debug!("Evicting cached artifacts for {}", path.display());
            if let Some(library) = record.library.take() {
                if let Err(reason) = library.close() {
                    tracing::warn!("Failed to close shared library {}: {}", path.display(), reason);
                }
            }
        }
    }

    /// Source text of a module
    pub fn get_source(&mut self, path: &Path) -> Result<Rc<str>> {
        if let Some(source) = self.fresh(path).and_then(|r| r.source.clone()) {
            tracing::trace!("source cache hit: {}", path.display());
            return Ok(source);
        }
        tracing::trace!("source cache miss: {}", path.display());

        let read_error = |source| CgiError::Read {
            path: path.to_path_buf(),
            source,
        };
        let modified = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map_err(read_error)?;
        let text = fs::read_to_string(path).map_err(read_error)?;

        let source: Rc<str> = Rc::from(strip_interpreter_line(&text));
        self.record_mut(path, modified).source = Some(source.clone());
        Ok(source)
    }

    /// Compiled module body.
    ///
    /// Compile errors are returned as-is and nothing is cached for them.
    pub fn get_compiled(&mut self, engine: &mut E, path: &Path) -> Result<Rc<E::Script>> {
        if let Some(script) = self.fresh(path).and_then(|r| r.compiled.clone()) {
            tracing::trace!("script cache hit: {}", path.display());
            return Ok(script);
        }
        tracing::trace!("script cache miss: {}", path.display());

        let source = self.get_source(path)?;
        let wrapped = engine.wrap_module(&source);
        let script = Rc::new(engine.compile(&wrapped, &path.to_string_lossy())?);

        if let Some(record) = self.records.get_mut(path) {
            record.compiled = Some(script.clone());
        }
        Ok(script)
    }

    /// Open shared library for a plugin module
    pub fn get_handle(&mut self, path: &Path) -> Result<&dyn PluginLibrary> {
        let cached = self.fresh(path).is_some_and(|r| r.library.is_some());
        if cached {
            tracing::trace!("library cache hit: {}", path.display());
        } else {
            tracing::trace!("library cache miss: {}", path.display());
            let modified = file_modified(path).ok_or_else(|| CgiError::PluginOpen {
                path: path.to_path_buf(),
                reason: "file not found".to_string(),
            })?;
            let library = self.loader.open(path).map_err(|reason| CgiError::PluginOpen {
                path: path.to_path_buf(),
                reason,
            })?;
            self.record_mut(path, modified).library = Some(library);
        }

        self.records
            .get(path)
            .and_then(|r| r.library.as_deref())
            .ok_or_else(|| CgiError::PluginOpen {
                path: path.to_path_buf(),
                reason: "library handle missing after load".to_string(),
            })
    }

    /// Exports object cached for `path` during this request
    pub fn get_exports(&self, path: &Path) -> Option<E::Value> {
        self.exports.get(path).cloned()
    }

    /// Cache an exports object
    pub fn set_exports(&mut self, path: PathBuf, exports: E::Value) {
        self.exports.insert(path, exports);
    }

    /// Forget the exports object for `path`
    pub fn clear_exports(&mut self, path: &Path) {
        self.exports.remove(path);
    }

    /// Forget every exports object
    pub fn clear_all_exports(&mut self) {
        self.exports.clear();
    }

    /// Number of cached exports objects
    pub fn exports_len(&self) -> usize {
        self.exports.len()
    }

    /// Check if artifacts are recorded for `path`, without validating them
    pub fn contains(&self, path: &Path) -> bool {
        self.records.contains_key(path)
    }

    /// Number of paths with recorded artifacts
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no artifacts are recorded
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn fresh(&mut self, path: &Path) -> Option<&mut CacheRecord<E>> {
        if self.is_stale(path) {
            return None;
        }
        self.records.get_mut(path)
    }

    fn record_mut(&mut self, path: &Path, modified: SystemTime) -> &mut CacheRecord<E> {
        if self.records.get(path).is_some_and(|r| r.modified != modified) {
            self.evict(path);
        }
        self.records
            .entry(path.to_path_buf())
            .or_insert_with(|| CacheRecord::new(modified))
    }
}

impl<E: Engine> Default for ArtifactCache<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn file_modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Remove a leading `#!` line, keeping its newline so line numbers hold.
fn strip_interpreter_line(text: &str) -> &str {
    if !text.starts_with("#!") {
        return text;
    }
    match text.find('\n') {
        Some(end) => &text[end..],
        None => "",
    }
}
