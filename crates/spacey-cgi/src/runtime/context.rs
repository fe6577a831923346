// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Execution context - one scripting environment plus its host state

use crate::config::HostConfig;
use crate::engine::{Engine, NativeFunction, ScriptError};
use crate::error::{CgiError, Result};
use crate::finalization::{Cleanup, FinalizationBridge};
use crate::module_system::{ArtifactCache, ModuleLoader, ModuleResolver};
use crate::request::Request;
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Name of the configuration object on the global
pub const CONFIG_GLOBAL: &str = "Config";

/// State shared between the context and the native bindings it installs
struct HostState<E: Engine> {
    /// Module loader of this context
    loader: ModuleLoader<E>,
    /// Pending native cleanups
    finalizers: Rc<FinalizationBridge<E>>,
    /// Callbacks registered through `onexit()`, in registration order
    on_exit: RefCell<Vec<E::Value>>,
    /// Configuration object of the current request
    config: RefCell<Option<E::Value>>,
    /// Set once `exit()` or [`ExecutionContext::terminate`] was called
    terminated: Cell<bool>,
    /// Library directory used when `Config.libraryPath` is unset
    library_path: PathBuf,
}

impl<E: Engine> HostState<E> {
    fn require(&self, engine: &mut E, specifier: &str, include: bool) -> Result<E::Value> {
        self.refresh_library_path(engine);
        let result = if include {
            self.loader.include(engine, specifier)
        } else {
            self.loader.require(engine, specifier)
        };
        self.finalizers.process_notifications(engine);
        result
    }

    fn refresh_library_path(&self, engine: &mut E) {
        let config = self.config.borrow().clone();
        let configured = config
            .and_then(|config| engine.get(&config, "libraryPath").ok().flatten())
            .and_then(|value| engine.as_string(&value))
            .filter(|path| !path.is_empty());

        let dir = match configured {
            Some(path) => PathBuf::from(path),
            None => self.library_path.clone(),
        };
        self.loader.set_default_library(Some(dir));
    }

    fn terminate(&self, engine: &mut E) {
        tracing::debug!("Terminating script execution");
        self.terminated.set(true);
        engine.terminate_execution();

        // Termination only lands at the engine's next interruption point; a
        // trivial run makes sure one is reached right away.
        if let Ok(noop) = engine.compile("", "<terminate>") {
            let _ = engine.run(&noop);
        }
    }
}

/// A scripting environment with the module system bound into it
pub struct ExecutionContext<E: Engine> {
    engine: E,
    state: Rc<HostState<E>>,
}

impl<E: Engine> ExecutionContext<E> {
    /// Create a context around a fresh engine
    pub fn new(engine: E, cache: Rc<RefCell<ArtifactCache<E>>>, host: &HostConfig) -> Self {
        let resolver = ModuleResolver::new().with_script_extension(host.script_extension.clone());
        let loader = ModuleLoader::new(resolver, cache);
        loader.set_search_paths(host.search_paths.clone());
        loader.set_default_library(Some(host.library_path.clone()));

        Self {
            engine,
            state: Rc::new(HostState {
                loader,
                finalizers: Rc::new(FinalizationBridge::new()),
                on_exit: RefCell::new(Vec::new()),
                config: RefCell::new(None),
                terminated: Cell::new(false),
                library_path: host.library_path.clone(),
            }),
        }
    }

    /// The engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The engine, mutably
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// The module loader
    pub fn loader(&self) -> &ModuleLoader<E> {
        &self.state.loader
    }

    /// Replace the explicit search-path list of this context
    pub fn set_search_paths(&self, paths: Vec<PathBuf>) {
        self.state.loader.set_search_paths(paths);
    }

    /// Finalizer registry, for native bindings that own resources
    pub fn finalizers(&self) -> Rc<FinalizationBridge<E>> {
        self.state.finalizers.clone()
    }

    /// Run `cleanup` once `object` is unreachable, or at teardown
    pub fn track_finalizer(&mut self, object: &E::Value, cleanup: Cleanup<E>) {
        self.state.finalizers.track(&mut self.engine, object, cleanup);
    }

    /// Configuration object of the current request
    pub fn config(&self) -> Option<E::Value> {
        self.state.config.borrow().clone()
    }

    /// Number of callbacks waiting in the on-exit queue
    pub fn on_exit_len(&self) -> usize {
        self.state.on_exit.borrow().len()
    }

    /// Returns true once execution was cancelled during this request
    pub fn is_terminated(&self) -> bool {
        self.state.terminated.get()
    }

    /// Cancel the running script
    pub fn terminate(&mut self) {
        let state = self.state.clone();
        state.terminate(&mut self.engine);
    }

    /// Bind a value on the global object
    pub fn define_global(&mut self, name: &str, value: E::Value) -> Result<()> {
        let global = self.engine.global();
        self.engine.set(&global, name, value)?;
        Ok(())
    }

    /// Bind a host function on the global object
    pub fn define_function(&mut self, name: &str, function: NativeFunction<E>) -> Result<()> {
        let function = self.engine.new_function(name, function);
        self.define_global(name, function)
    }

    /// Load a module from the host side
    pub fn require(&mut self, specifier: &str) -> Result<E::Value> {
        let state = self.state.clone();
        state.require(&mut self.engine, specifier, false)
    }

    /// Load a module and flatten its exports into the global object
    pub fn include(&mut self, specifier: &str) -> Result<E::Value> {
        let state = self.state.clone();
        state.require(&mut self.engine, specifier, true)
    }

    /// Install the per-request globals.
    ///
    /// Binds `require`, `include`, `onexit`, `exit`, `global`, `system` and a
    /// fresh `Config` object.
    pub fn install_globals(&mut self, request: &Request) -> Result<()> {
        self.state.terminated.set(false);
        self.state.on_exit.borrow_mut().clear();

        self.define_function("require", self.loader_binding(false))?;
        self.define_function("include", self.loader_binding(true))?;
        self.define_function("onexit", self.on_exit_binding())?;
        self.define_function("exit", self.exit_binding())?;

        let global = self.engine.global();
        self.define_global("global", global)?;

        let system = self.system_object(request)?;
        self.define_global("system", system)?;

        let config = self.engine.new_object();
        let library_path = self.engine.new_string(&self.state.library_path.to_string_lossy());
        self.engine.set(&config, "libraryPath", library_path)?;
        let autoload = self.engine.new_array(Vec::new());
        self.engine.set(&config, "libraryAutoload", autoload)?;
        self.define_global(CONFIG_GLOBAL, config.clone())?;
        *self.state.config.borrow_mut() = Some(config);
        Ok(())
    }

    /// Require the configuration module, then every `Config.libraryAutoload`
    /// entry in order. The first failure aborts.
    pub fn load_configuration(&mut self, config_module: &Path) -> Result<()> {
        let specifier = absolute(config_module).to_string_lossy().into_owned();
        tracing::debug!("Loading configuration module {}", specifier);
        self.require(&specifier)
            .map_err(|source| configuration_error(&specifier, source))?;

        for specifier in self.autoload_list()? {
            tracing::debug!("Autoloading {}", specifier);
            self.require(&specifier)
                .map_err(|source| configuration_error(&specifier, source))?;
        }
        Ok(())
    }

    /// Main module of the request.
    ///
    /// `Config.mainFile` overrides the request's own target. Without it the
    /// order is the explicit main file, then `PATH_TRANSLATED`, then
    /// `SCRIPT_FILENAME`. Relative paths are taken against the working directory.
    pub fn locate_main(&mut self, request: &Request) -> Option<PathBuf> {
        let forced = self.config_string("mainFile").filter(|path| !path.is_empty());
        let target = forced.map(PathBuf::from).or_else(|| request.target())?;
        Some(absolute(&target))
    }

    /// Run the main module
    pub fn run_main(&mut self, path: &Path) -> Result<E::Value> {
        tracing::debug!("Running main module {}", path.display());
        self.require(&path.to_string_lossy())
    }

    /// Invoke the on-exit callbacks in registration order.
    ///
    /// Each callback is released once it ran; callbacks registered meanwhile
    /// run too. Returns the failures that should be reported.
    pub fn run_on_exit(&mut self) -> Vec<ScriptError> {
        let mut errors = Vec::new();
        loop {
            let callback = {
                let mut queue = self.state.on_exit.borrow_mut();
                if queue.is_empty() {
                    break;
                }
                queue.remove(0)
            };
            let receiver = self.engine.undefined();
            if let Err(err) = self.engine.call(&callback, &receiver, &[]) {
                if err.is_termination() || self.is_terminated() {
                    tracing::debug!("Suppressed on-exit failure after termination: {}", err);
                } else {
                    errors.push(err);
                }
            }
        }
        errors
    }

    /// Request teardown.
    ///
    /// Runs the on-exit queue, flushes every pending finalizer, forgets all
    /// exports and drains the path stack. Returns on-exit failures.
    pub fn teardown(&mut self) -> Vec<ScriptError> {
        let errors = self.run_on_exit();

        let finalizers = self.state.finalizers.clone();
        finalizers.process_notifications(&mut self.engine);
        finalizers.flush_all(&mut self.engine);

        self.state.loader.cache().borrow_mut().clear_all_exports();
        self.state.loader.clear_paths();
        errors
    }

    /// Delete every top-level binding so the context can serve another request
    pub fn strip_globals(&mut self) -> Result<usize> {
        let global = self.engine.global();
        let keys = self.engine.keys(&global)?;
        for key in &keys {
            self.engine.delete(&global, key)?;
        }

        *self.state.config.borrow_mut() = None;
        self.state.on_exit.borrow_mut().clear();
        self.state.terminated.set(false);
        tracing::trace!("Stripped {} global bindings", keys.len());
        Ok(keys.len())
    }

    fn loader_binding(&self, include: bool) -> NativeFunction<E> {
        let state = self.state.clone();
        let name = if include { "include" } else { "require" };
        Rc::new(move |engine: &mut E, args: &[E::Value]| {
            let specifier = args
                .first()
                .and_then(|arg| engine.as_string(arg))
                .ok_or_else(|| ScriptError::runtime(format!("TypeError: {}() expects a module name", name)))?;
            state
                .require(engine, &specifier, include)
                .map_err(CgiError::into_script_error)
        })
    }

    fn on_exit_binding(&self) -> NativeFunction<E> {
        let state = self.state.clone();
        Rc::new(move |engine: &mut E, args: &[E::Value]| {
            let callback = args
                .first()
                .filter(|arg| engine.is_callable(arg))
                .cloned()
                .ok_or_else(|| ScriptError::runtime("TypeError: onexit() expects a function"))?;
            state.on_exit.borrow_mut().push(callback);
            Ok(engine.undefined())
        })
    }

    fn exit_binding(&self) -> NativeFunction<E> {
        let state = self.state.clone();
        Rc::new(move |engine: &mut E, _args: &[E::Value]| {
            state.terminate(engine);
            Ok(engine.undefined())
        })
    }

    fn system_object(&mut self, request: &Request) -> Result<E::Value> {
        let engine = &mut self.engine;
        let system = engine.new_object();

        let mut args = Vec::with_capacity(request.args.len() + 1);
        if let Some(main) = request.target() {
            args.push(engine.new_string(&main.to_string_lossy()));
        }
        for arg in &request.args {
            args.push(engine.new_string(arg));
        }
        let args = engine.new_array(args);
        engine.set(&system, "args", args)?;

        let env = engine.new_object();
        for (key, value) in &request.env {
            let value = engine.new_string(value);
            engine.set(&env, key, value)?;
        }
        engine.set(&system, "env", env)?;

        Ok(system)
    }

    fn autoload_list(&mut self) -> Result<Vec<String>> {
        let Some(config) = self.config() else {
            return Ok(Vec::new());
        };
        let Some(list) = self.engine.get(&config, "libraryAutoload")? else {
            return Ok(Vec::new());
        };
        let Some(items) = self.engine.array_elements(&list) else {
            tracing::warn!("Config.libraryAutoload is not an array; ignoring it");
            return Ok(Vec::new());
        };

        Ok(items
            .iter()
            .filter_map(|item| {
                let name = self.engine.as_string(item);
                if name.is_none() {
                    tracing::warn!("Skipping non-string Config.libraryAutoload entry {:?}", item);
                }
                name
            })
            .collect())
    }

    fn config_string(&mut self, key: &str) -> Option<String> {
        let config = self.config()?;
        let value = self.engine.get(&config, key).ok().flatten()?;
        self.engine.as_string(&value)
    }
}

fn configuration_error(module: &str, source: CgiError) -> CgiError {
    if source.is_termination() {
        return source;
    }
    CgiError::Configuration {
        module: module.to_string(),
        source: Box::new(source),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
