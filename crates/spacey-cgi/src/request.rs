// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Request signals and output channels supplied by the protocol layer

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;

/// CGI variable naming the translated script path
pub const PATH_TRANSLATED: &str = "PATH_TRANSLATED";

/// CGI variable naming the script file
pub const SCRIPT_FILENAME: &str = "SCRIPT_FILENAME";

/// One script-driven request
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Main file given on the command line
    pub main_file: Option<PathBuf>,
    /// Arguments following the main file
    pub args: Vec<String>,
    /// Environment signals (CGI meta-variables)
    pub env: BTreeMap<String, String>,
}

impl Request {
    /// Create an empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the explicit main file
    pub fn with_main_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.main_file = Some(path.into());
        self
    }

    /// Set the script arguments
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an environment signal
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Main module named by the invoking layer.
    ///
    /// The explicit main file wins, then `PATH_TRANSLATED`, then `SCRIPT_FILENAME`.
    pub fn target(&self) -> Option<PathBuf> {
        self.main_file
            .clone()
            .or_else(|| self.env_path(PATH_TRANSLATED))
            .or_else(|| self.env_path(SCRIPT_FILENAME))
    }

    fn env_path(&self, key: &str) -> Option<PathBuf> {
        self.env
            .get(key)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }
}

/// Output channels of a request
pub trait RequestIo {
    /// Raw response output
    fn write_output(&mut self, data: &[u8]) -> io::Result<()>;

    /// Process error stream
    fn write_error(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Process stdout/stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StdIo;

impl RequestIo for StdIo {
    fn write_output(&mut self, data: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(data)?;
        out.flush()
    }

    fn write_error(&mut self, data: &[u8]) -> io::Result<()> {
        io::stderr().lock().write_all(data)
    }
}

/// In-memory channels
#[derive(Debug, Default, Clone)]
pub struct BufferedIo {
    /// Bytes written to the output channel
    pub output: Vec<u8>,
    /// Bytes written to the error channel
    pub error: Vec<u8>,
}

impl BufferedIo {
    /// Output as lossy UTF-8
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Error stream as lossy UTF-8
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.error).into_owned()
    }
}

impl RequestIo for BufferedIo {
    fn write_output(&mut self, data: &[u8]) -> io::Result<()> {
        self.output.extend_from_slice(data);
        Ok(())
    }

    fn write_error(&mut self, data: &[u8]) -> io::Result<()> {
        self.error.extend_from_slice(data);
        Ok(())
    }
}
