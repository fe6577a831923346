// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Request lifecycle

use crate::config::HostConfig;
use crate::engine::Engine;
use crate::error::{CgiError, Result};
use crate::module_system::{ArtifactCache, LibraryLoader};
use crate::request::{Request, RequestIo};
use crate::runtime::context::ExecutionContext;
use crate::runtime::report;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Builds a fresh engine for every new execution context
pub type EngineFactory<E> = Box<dyn FnMut() -> E>;

/// Installs protocol-level bindings (such as `response`) during bootstrap
pub type BindingsHook<E> = Box<dyn FnMut(&mut ExecutionContext<E>, &Request) -> Result<()>>;

/// Stages a request goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Creating or recycling the execution context
    Acquiring,
    /// Installing globals and loading configuration
    Bootstrapping,
    /// Picking the main module
    Locating,
    /// Running the main module
    Running,
    /// On-exit callbacks, finalizers, cache cleanup
    Finishing,
    /// Context destroyed
    Disposed,
    /// Context parked for the next request
    Idle,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Acquiring => "acquiring",
            Phase::Bootstrapping => "bootstrapping",
            Phase::Locating => "locating",
            Phase::Running => "running",
            Phase::Finishing => "finishing",
            Phase::Disposed => "disposed",
            Phase::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Serves script-driven requests one at a time
pub struct CgiRuntime<E: Engine> {
    /// Host settings
    config: HostConfig,
    /// Engine constructor
    factory: EngineFactory<E>,
    /// Process-wide artifact cache
    cache: Rc<RefCell<ArtifactCache<E>>>,
    /// Protocol bindings installed into every request
    bindings: Option<BindingsHook<E>>,
    /// Context kept warm in reuse mode
    parked: Option<ExecutionContext<E>>,
    /// Current lifecycle stage
    phase: Phase,
    /// Requests served so far
    served: u64,
}

impl<E: Engine> CgiRuntime<E> {
    /// Create a runtime loading plugins through the platform dynamic linker
    pub fn new(config: HostConfig, factory: impl FnMut() -> E + 'static) -> Self {
        Self::with_cache(config, factory, ArtifactCache::new())
    }

    /// Create a runtime with a custom plugin loader
    pub fn with_loader(
        config: HostConfig,
        factory: impl FnMut() -> E + 'static,
        loader: Box<dyn LibraryLoader>,
    ) -> Self {
        Self::with_cache(config, factory, ArtifactCache::with_loader(loader))
    }

    fn with_cache(
        config: HostConfig,
        factory: impl FnMut() -> E + 'static,
        cache: ArtifactCache<E>,
    ) -> Self {
        Self {
            config,
            factory: Box::new(factory),
            cache: Rc::new(RefCell::new(cache)),
            bindings: None,
            parked: None,
            phase: Phase::Idle,
            served: 0,
        }
    }

    /// Install extra bindings into every request's context during bootstrap,
    /// before the configuration module runs
    pub fn set_bindings(
        &mut self,
        hook: impl FnMut(&mut ExecutionContext<E>, &Request) -> Result<()> + 'static,
    ) {
        self.bindings = Some(Box::new(hook));
    }

    /// Host settings
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The process-wide artifact cache
    pub fn cache(&self) -> &Rc<RefCell<ArtifactCache<E>>> {
        &self.cache
    }

    /// Context parked for the next request (reuse mode only)
    pub fn parked_context(&self) -> Option<&ExecutionContext<E>> {
        self.parked.as_ref()
    }

    /// Current lifecycle stage
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of requests served so far
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Serve one request and return its exit status.
    ///
    /// `0` means success (or a cancelled script), `1` means the request
    /// failed; failures have already been reported through `io`.
    pub fn execute(&mut self, request: &Request, io: &mut dyn RequestIo) -> i32 {
        self.served += 1;
        tracing::debug!("Serving request #{}", self.served);

        self.enter(Phase::Acquiring);
        let mut context = self.acquire();

        let status = self.serve(&mut context, request, io);

        self.enter(Phase::Finishing);
        for err in context.teardown() {
            report::report_uncaught(context.engine_mut(), io, &CgiError::Script(err));
        }

        if self.config.reuse_context {
            self.parked = Some(context);
            self.enter(Phase::Idle);
        } else {
            drop(context);
            self.enter(Phase::Disposed);
        }
        status
    }

    fn serve(
        &mut self,
        context: &mut ExecutionContext<E>,
        request: &Request,
        io: &mut dyn RequestIo,
    ) -> i32 {
        self.enter(Phase::Bootstrapping);
        if let Err(err) = self.bootstrap(context, request) {
            if context.is_terminated() || err.is_termination() {
                tracing::warn!("Script execution cancelled during bootstrap");
                return 0;
            }
            tracing::debug!("Bootstrap failed: {}", err);
            report::report_fatal(io, &err);
            return 1;
        }

        self.enter(Phase::Locating);
        let Some(main) = context.locate_main(request) else {
            report::report_fatal(io, &CgiError::NothingToDo);
            return 1;
        };

        self.enter(Phase::Running);
        match context.run_main(&main) {
            Ok(_) => 0,
            Err(err) if context.is_terminated() || err.is_termination() => {
                tracing::warn!("Script execution cancelled: {}", main.display());
                0
            }
            Err(err) => {
                tracing::debug!("Uncaught error in {}: {}", main.display(), err);
                report::report_uncaught(context.engine_mut(), io, &err);
                1
            }
        }
    }

    fn bootstrap(&mut self, context: &mut ExecutionContext<E>, request: &Request) -> Result<()> {
        context.install_globals(request)?;
        if let Some(hook) = self.bindings.as_mut() {
            hook(context, request)?;
        }
        context.load_configuration(&self.config.config_module)
    }

    fn acquire(&mut self) -> ExecutionContext<E> {
        if self.config.reuse_context {
            if let Some(mut context) = self.parked.take() {
                match context.strip_globals() {
                    Ok(_) => return context,
                    Err(err) => {
                        tracing::warn!("Discarding parked context, stripping failed: {}", err)
                    }
                }
            }
        }
        ExecutionContext::new((self.factory)(), self.cache.clone(), &self.config)
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!("Request lifecycle: {} -> {}", self.phase, phase);
        self.phase = phase;
    }
}
