// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Scripting engine boundary
//!
//! The host never interprets script text itself. Everything it needs from an
//! engine (compiling, running, calling, touching object properties and
//! lifetime notifications) goes through the [`Engine`] trait.

use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;

/// A host function exposed to scripts.
///
/// The engine hands itself back to the native code, so a binding such as
/// `require` can compile and run further modules while the calling script is
/// still on the stack.
pub type NativeFunction<E> =
    Rc<dyn Fn(&mut E, &[<E as Engine>::Value]) -> Result<<E as Engine>::Value, ScriptError>>;

/// Kind of failure reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorKind {
    /// Source text failed to compile
    Compile,
    /// Script threw while running
    Runtime,
    /// Execution was aborted by [`Engine::terminate_execution`]
    Terminated,
}

/// An exception surfaced by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    /// What went wrong
    pub kind: ScriptErrorKind,
    /// Engine-provided message (already stringified)
    pub message: String,
    /// Resource name the failing code was compiled under
    pub resource: Option<String>,
    /// 1-based line number inside `resource`
    pub line: Option<u32>,
}

impl ScriptError {
    /// Create a compile error without location
    pub fn compile(message: impl Into<String>) -> Self {
        Self {
            kind: ScriptErrorKind::Compile,
            message: message.into(),
            resource: None,
            line: None,
        }
    }

    /// Create a runtime error without location
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: ScriptErrorKind::Runtime,
            message: message.into(),
            resource: None,
            line: None,
        }
    }

    /// Create a termination artifact
    pub fn terminated() -> Self {
        Self {
            kind: ScriptErrorKind::Terminated,
            message: "Script execution terminated".to_string(),
            resource: None,
            line: None,
        }
    }

    /// Attach a resource name and line number
    pub fn at(mut self, resource: impl Into<String>, line: u32) -> Self {
        self.resource = Some(resource.into());
        self.line = Some(line);
        self
    }

    /// Returns true if this error only exists because execution was cancelled.
    pub fn is_termination(&self) -> bool {
        self.kind == ScriptErrorKind::Terminated
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.resource, self.line) {
            (Some(resource), Some(line)) => write!(f, "{}:{}: {}", resource, line, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

/// The scripting engine as seen by the host.
///
/// Object identity is reference identity: cloning a `Value` that refers to an
/// object yields another reference to the same object.
pub trait Engine: Sized + 'static {
    /// A script value
    type Value: Clone + fmt::Debug;
    /// Compiled form of a source text.
    ///
    /// Compiled forms are cached across requests, so any engine instance built
    /// by the same factory must be able to run them.
    type Script;
    /// Non-rooting handle to an object tracked for finalization
    type Weak: Clone + PartialEq + fmt::Debug;

    /// Compile `source`, reporting errors against `name`.
    fn compile(&mut self, source: &str, name: &str) -> Result<Self::Script, ScriptError>;

    /// Run a compiled script in the engine's global scope.
    fn run(&mut self, script: &Self::Script) -> Result<Self::Value, ScriptError>;

    /// Call `function` with the given receiver and arguments.
    fn call(
        &mut self,
        function: &Self::Value,
        receiver: &Self::Value,
        args: &[Self::Value],
    ) -> Result<Self::Value, ScriptError>;

    /// The global object
    fn global(&mut self) -> Self::Value;

    /// The `undefined` value
    fn undefined(&mut self) -> Self::Value;

    /// Create an empty plain object
    fn new_object(&mut self) -> Self::Value;

    /// Create an array holding `items`
    fn new_array(&mut self, items: Vec<Self::Value>) -> Self::Value;

    /// Create a string value
    fn new_string(&mut self, value: &str) -> Self::Value;

    /// Wrap a host function as a callable script value
    fn new_function(&mut self, name: &str, function: NativeFunction<Self>) -> Self::Value;

    /// Read a property; `Ok(None)` when it is absent.
    fn get(&mut self, object: &Self::Value, key: &str) -> Result<Option<Self::Value>, ScriptError>;

    /// Write a property
    fn set(&mut self, object: &Self::Value, key: &str, value: Self::Value) -> Result<(), ScriptError>;

    /// Remove a property
    fn delete(&mut self, object: &Self::Value, key: &str) -> Result<(), ScriptError>;

    /// Own enumerable property names
    fn keys(&mut self, object: &Self::Value) -> Result<Vec<String>, ScriptError>;

    /// String contents, if the value is a string
    fn as_string(&self, value: &Self::Value) -> Option<String>;

    /// Elements of an array value, if the value is an array
    fn array_elements(&mut self, value: &Self::Value) -> Option<Vec<Self::Value>>;

    /// Returns true if the value can be called
    fn is_callable(&self, value: &Self::Value) -> bool;

    /// Returns true if the value is `undefined`
    fn is_undefined(&self, value: &Self::Value) -> bool;

    /// Start watching `object` for unreachability.
    fn track_for_finalization(&mut self, object: &Self::Value) -> Self::Weak;

    /// Recover the object behind a tracked handle, if the engine still has it.
    fn materialize(&mut self, handle: &Self::Weak) -> Option<Self::Value>;

    /// Stop watching a handle
    fn untrack(&mut self, handle: &Self::Weak);

    /// Drain pending unreachability notifications.
    ///
    /// Each entry carries the handle together with the object, kept alive by
    /// the engine until the notification has been consumed.
    fn take_unreachable(&mut self) -> Vec<(Self::Weak, Self::Value)>;

    /// Ask the engine to abort script execution at its next interruptible point.
    fn terminate_execution(&mut self);

    /// Invoke a native plugin's init entry point.
    ///
    /// # Safety
    ///
    /// `entry` must be the address of a function with this engine's plugin
    /// signature, and the library it lives in must stay open for the call.
    unsafe fn init_plugin(
        &mut self,
        entry: *const c_void,
        exports: &Self::Value,
        module: &Self::Value,
    ) -> Result<(), ScriptError>;

    /// Wrap a module body so that running it yields a function of
    /// `(exports, module)`.
    ///
    /// The prefix stays on the first source line so reported line numbers
    /// match the file on disk.
    fn wrap_module(&self, source: &str) -> String {
        format!("(function (exports, module) {{ {}\nreturn exports;\n}})", source)
    }
}
