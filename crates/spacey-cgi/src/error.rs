// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the CGI host

use crate::engine::ScriptError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for host operations
pub type Result<T> = std::result::Result<T, CgiError>;

/// Errors that can occur while serving a request
#[derive(Debug, Error)]
pub enum CgiError {
    /// Module specifier did not resolve to a file
    #[error("Cannot find module '{0}'")]
    ModuleNotFound(String),

    /// Module file exists but could not be read
    #[error("Cannot read module '{}': {source}", path.display())]
    Read {
        /// Resolved module path
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// Exception reported by the scripting engine
    #[error("{0}")]
    Script(#[from] ScriptError),

    /// Shared library could not be opened
    #[error("Error opening shared library '{}': {reason}", path.display())]
    PluginOpen {
        /// Library path
        path: PathBuf,
        /// Loader message
        reason: String,
    },

    /// Shared library has no usable init entry point, or init failed
    #[error("Cannot initialize shared library '{}': {reason}", path.display())]
    PluginInit {
        /// Library path
        path: PathBuf,
        /// Reason for failure
        reason: String,
    },

    /// Configuration module or an autoloaded library failed
    #[error("Cannot load configuration module '{module}': {source}")]
    Configuration {
        /// Specifier that failed
        module: String,
        /// Failure while loading it
        #[source]
        source: Box<CgiError>,
    },

    /// No main module could be determined for the request
    #[error("Nothing to do.")]
    NothingToDo,

    /// Host configuration file error
    #[error("Invalid host configuration: {0}")]
    Config(String),
}

impl CgiError {
    /// Create a module not found error
    pub fn module_not_found(module: impl Into<String>) -> Self {
        Self::ModuleNotFound(module.into())
    }

    /// Returns true if this error is a cancellation artifact
    pub fn is_termination(&self) -> bool {
        matches!(self, CgiError::Script(err) if err.is_termination())
    }

    /// Convert into an exception that a requiring script can catch.
    ///
    /// Engine errors pass through untouched so their location survives.
    pub fn into_script_error(self) -> ScriptError {
        match self {
            CgiError::Script(err) => err,
            other => ScriptError::runtime(other.to_string()),
        }
    }
}
