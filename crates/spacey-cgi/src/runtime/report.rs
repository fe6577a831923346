// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error reporting

use crate::engine::{Engine, ScriptError};
use crate::error::CgiError;
use crate::request::RequestIo;

/// Render an exception as `resource:line: message`, or just the message
/// when the engine gave no location.
pub fn format_exception(err: &ScriptError) -> String {
    format!("{}\n", err)
}

/// Render any host error for reporting
pub fn format_error(err: &CgiError) -> String {
    match err {
        CgiError::Script(script) => format_exception(script),
        other => format!("{}\n", other),
    }
}

/// Report an error that escaped a script.
///
/// Goes to `response.write` when the environment has one, otherwise to the
/// raw output channel. Cancellation artifacts are dropped.
pub fn report_uncaught<E: Engine>(engine: &mut E, io: &mut dyn RequestIo, err: &CgiError) {
    if err.is_termination() {
        tracing::debug!("Not reporting termination artifact");
        return;
    }
    let message = format_error(err);

    if let Some((response, write)) = response_writer(engine) {
        let text = engine.new_string(&message);
        match engine.call(&write, &response, &[text]) {
            Ok(_) => return,
            Err(failure) => {
                tracing::warn!("response.write failed while reporting an error: {}", failure)
            }
        }
    }

    if let Err(e) = io.write_output(message.as_bytes()) {
        tracing::warn!("Failed to write error report: {}", e);
    }
}

/// Report a failure that happened before the scripting environment could be
/// trusted (bootstrap, locating).
pub fn report_fatal(io: &mut dyn RequestIo, err: &CgiError) {
    if err.is_termination() {
        return;
    }
    if let Err(e) = io.write_error(format_error(err).as_bytes()) {
        tracing::warn!("Failed to write to the error stream: {}", e);
    }
}

fn response_writer<E: Engine>(engine: &mut E) -> Option<(E::Value, E::Value)> {
    let global = engine.global();
    let response = engine.get(&global, "response").ok().flatten()?;
    let write = engine.get(&response, "write").ok().flatten()?;
    engine.is_callable(&write).then_some((response, write))
}
