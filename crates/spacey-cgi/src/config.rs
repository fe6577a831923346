// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Host configuration
//!
//! Loads configuration from (in order of precedence):
//! 1. Environment variables (`SPACEY_CGI_*`)
//! 2. A TOML file passed to [`HostConfig::load`]
//! 3. Built-in defaults

use crate::error::{CgiError, Result};
use crate::module_system::SCRIPT_EXTENSION;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration module
pub const ENV_CONFIG: &str = "SPACEY_CGI_CONFIG";

/// Environment variable naming the default library directory
pub const ENV_LIBRARY_PATH: &str = "SPACEY_CGI_LIBRARY_PATH";

/// Environment variable enabling context reuse
pub const ENV_REUSE_CONTEXT: &str = "SPACEY_CGI_REUSE_CONTEXT";

/// Host settings that exist before any script runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Configuration script required at the start of every request
    pub config_module: PathBuf,
    /// Keep one execution context warm across requests
    pub reuse_context: bool,
    /// Default library directory for bare specifiers
    pub library_path: PathBuf,
    /// Explicit search paths; when non-empty they replace every library directory
    pub search_paths: Vec<PathBuf>,
    /// Extension of script modules, without the dot
    pub script_extension: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            config_module: PathBuf::from("/etc/spacey-cgi/config.script"),
            reuse_context: false,
            library_path: PathBuf::from("/usr/lib/spacey-cgi"),
            search_paths: Vec::new(),
            script_extension: SCRIPT_EXTENSION.to_string(),
        }
    }
}

impl HostConfig {
    /// Parse a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CgiError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content).map_err(|e| match e {
            CgiError::Config(reason) => CgiError::Config(format!("{}: {}", path.display(), reason)),
            other => other,
        })
    }

    /// Parse TOML configuration text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CgiError::Config(e.to_string()))
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(std::env::vars());
        config
    }

    /// Apply `SPACEY_CGI_*` overrides from `vars`
    pub fn apply_env<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                ENV_CONFIG => self.config_module = PathBuf::from(value),
                ENV_LIBRARY_PATH => self.library_path = PathBuf::from(value),
                ENV_REUSE_CONTEXT => match parse_flag(value) {
                    Some(flag) => self.reuse_context = flag,
                    None => tracing::warn!("Ignoring {}={:?}: expected a boolean", ENV_REUSE_CONTEXT, value),
                },
                _ => {}
            }
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
