// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module path resolution
//!
//! Turns a specifier into a normalized absolute path:
//! - absolute specifiers are normalized in place
//! - `.`/`..` specifiers are joined with the directory of the running module
//! - bare specifiers are looked up in the search paths, first hit wins
//!
//! Every candidate is probed as-is, then with the script extension, then with
//! the platform's shared library extension.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Default extension of script modules
pub const SCRIPT_EXTENSION: &str = "script";

/// What kind of artifact a resolved path refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Script source compiled by the engine
    Script,
    /// Native shared library
    Plugin,
}

/// Directories of the modules currently executing, innermost last
#[derive(Debug, Default, Clone)]
pub struct PathStack {
    dirs: Vec<PathBuf>,
}

impl PathStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a module living in `dir`
    pub fn push(&mut self, dir: PathBuf) {
        self.dirs.push(dir);
    }

    /// Leave the innermost module
    pub fn pop(&mut self) -> Option<PathBuf> {
        self.dirs.pop()
    }

    /// Directory of the innermost running module
    pub fn top(&self) -> Option<&Path> {
        self.dirs.last().map(PathBuf::as_path)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.dirs.clear();
    }

    /// Number of nested modules
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Check if no module is running
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

/// Module resolver
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    /// Extension probed for script modules
    script_extension: String,
    /// Extension probed for native plugins
    library_extension: String,
}

impl ModuleResolver {
    /// Create a resolver probing `.script` and the platform library extension
    pub fn new() -> Self {
        Self {
            script_extension: SCRIPT_EXTENSION.to_string(),
            library_extension: std::env::consts::DLL_EXTENSION.to_string(),
        }
    }

    /// Use a different script extension (without the leading dot)
    pub fn with_script_extension(mut self, extension: impl Into<String>) -> Self {
        self.script_extension = extension.into();
        self
    }

    /// Resolve a module specifier.
    ///
    /// `search_paths` is the effective list for bare specifiers; the caller
    /// decides whether that is an explicit per-context list or the default
    /// library directory.
    pub fn resolve(
        &self,
        specifier: &str,
        stack: &PathStack,
        search_paths: &[PathBuf],
    ) -> Option<PathBuf> {
        if specifier.is_empty() {
            return None;
        }

        let path = Path::new(specifier);
        if path.is_absolute() {
            return self.probe(&normalize(path));
        }

        if is_relative_specifier(specifier) {
            let base = match stack.top() {
                Some(dir) => dir.to_path_buf(),
                None => std::env::current_dir().ok()?,
            };
            return self.probe(&normalize(&base.join(path)));
        }

        search_paths.iter().find_map(|dir| {
            let candidate = absolutize(&dir.join(path))?;
            self.probe(&normalize(&candidate))
        })
    }

    /// Categorize a resolved path by its extension
    pub fn kind(&self, path: &Path) -> ModuleKind {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext == self.library_extension => ModuleKind::Plugin,
            _ => ModuleKind::Script,
        }
    }

    /// Try the path as-is, then with each known extension appended
    fn probe(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(path.to_path_buf());
        }

        [&self.script_extension, &self.library_extension]
            .into_iter()
            .map(|ext| with_appended_extension(path, ext))
            .find(|candidate| candidate.is_file())
    }
}

impl Default for ModuleResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse `.` and `..` segments lexically (POSIX path algebra).
///
/// `..` at the root stays at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn is_relative_specifier(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || (cfg!(windows) && (specifier.starts_with(".\\") || specifier.starts_with("..\\")))
}

fn absolutize(path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        std::env::current_dir().ok().map(|cwd| cwd.join(path))
    }
}

fn with_appended_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
