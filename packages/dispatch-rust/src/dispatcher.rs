//! The dispatcher: the object callers hold.
//!
//! Owns the dependency registry, the handler registry, the middleware pipeline
//! and the context store, and builds the [`DispatchBus`] lazily on first use.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use switchyard_core::{AttachContext, Attributes, BoxRecord, ContextError, ContextScope, ContextStore, Record};

use crate::bus::{downcast_output, DispatchBus, ErrorHandler, Layer, OperationBus};
use crate::config::DispatchConfig;
use crate::dependency::{Dependencies, DependencyRegistry};
use crate::error::DispatchError;
use crate::handler::{HandlerKind, Operation, Orchestrator};
use crate::middleware::{Middleware, MiddlewarePipeline};
use crate::registry::{BuildPlan, HandlerRegistry};

/// Entry point for one bounded capability.
///
/// Bootstrap order: dependencies, then handlers and middlewares, then
/// [`Dispatcher::build`] (or just the first [`Dispatcher::call`]). Once built,
/// every registration method fails with [`DispatchError::AlreadyBuilt`].
///
/// Dispatchers share nothing with each other: each owns its registries and its
/// context store.
pub struct Dispatcher {
    config: DispatchConfig,
    dependencies: DependencyRegistry,
    handlers: HandlerRegistry,
    pipeline: MiddlewarePipeline,
    store: ContextStore,
    on_error: Option<ErrorHandler>,
    on_operation_error: Option<ErrorHandler>,
    on_orchestrator_error: Option<ErrorHandler>,
    bus: ArcSwapOption<DispatchBus>,
    build_lock: Mutex<()>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.config.name)
            .field("handlers", &self.handlers)
            .field("dependencies", &self.dependencies.len())
            .field("pipeline", &self.pipeline)
            .field("built", &self.is_built())
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: DispatchConfig) -> Self {
        let store = ContextStore::new(config.context.clone());
        Self {
            config,
            dependencies: DependencyRegistry::new(),
            handlers: HandlerRegistry::new(),
            pipeline: MiddlewarePipeline::new(),
            store,
            on_error: None,
            on_operation_error: None,
            on_orchestrator_error: None,
            bus: ArcSwapOption::empty(),
            build_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.is_built() {
            return Err(DispatchError::AlreadyBuilt);
        }
        Ok(())
    }

    // -- registration -------------------------------------------------------

    /// Bind `value` under `name` for every handler factory.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyBuilt`] after build, or
    /// [`DispatchError::DependencyAlreadyRegistered`] if `name` is taken.
    pub fn add_dependency<T: std::any::Any + Send + Sync>(
        &mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.dependencies.add(name, value)
    }

    /// Bind an already shared value under `name`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::add_dependency`].
    pub fn add_shared_dependency<T: std::any::Any + Send + Sync>(
        &mut self,
        name: impl Into<String>,
        value: Arc<T>,
    ) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.dependencies.add_shared(name, value)
    }

    /// Register the operation handling `H::Command`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyBuilt`] after build, or
    /// [`DispatchError::DuplicateRegistration`] if the command type is taken.
    pub fn register_operation<H, F>(&mut self, factory: F) -> Result<(), DispatchError>
    where
        H: Operation,
        F: Fn(&Dependencies) -> Result<H, DispatchError> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.handlers.register_operation(factory)
    }

    /// Register the orchestrator handling `H::Command`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::register_operation`].
    pub fn register_orchestrator<H, F>(&mut self, factory: F) -> Result<(), DispatchError>
    where
        H: Orchestrator,
        F: Fn(&Dependencies, OperationBus) -> Result<H, DispatchError> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.handlers.register_orchestrator(factory)
    }

    /// # Errors
    ///
    /// [`DispatchError::AlreadyBuilt`] after build.
    pub fn add_middleware(&mut self, middleware: impl Middleware) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.pipeline.add(middleware);
        Ok(())
    }

    /// Add a middleware the caller keeps a handle to.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyBuilt`] after build.
    pub fn add_shared_middleware(&mut self, middleware: Arc<dyn Middleware>) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.pipeline.add_shared(middleware);
        Ok(())
    }

    /// Facade-level fallback, consulted for any recoverable error the layer
    /// handlers did not resolve.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyBuilt`] after build.
    pub fn set_error_handler(
        &mut self,
        handler: impl Fn(DispatchError) -> Result<BoxRecord, DispatchError> + Send + Sync + 'static,
    ) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.on_error = Some(Arc::new(handler));
        Ok(())
    }

    /// Fallback for failing operations, including those called by orchestrators.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyBuilt`] after build.
    pub fn set_operation_error_handler(
        &mut self,
        handler: impl Fn(DispatchError) -> Result<BoxRecord, DispatchError> + Send + Sync + 'static,
    ) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.on_operation_error = Some(Arc::new(handler));
        Ok(())
    }

    /// Fallback for failing orchestrators.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyBuilt`] after build.
    pub fn set_orchestrator_error_handler(
        &mut self,
        handler: impl Fn(DispatchError) -> Result<BoxRecord, DispatchError> + Send + Sync + 'static,
    ) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.on_orchestrator_error = Some(Arc::new(handler));
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    #[must_use]
    pub fn is_built(&self) -> bool {
        self.bus.load().is_some()
    }

    /// Freeze the dependencies, instantiate every handler and assemble the
    /// facade. Idempotent; concurrent first callers build exactly once.
    ///
    /// # Errors
    ///
    /// Returns the first factory error (e.g. [`DispatchError::MissingDependency`]).
    /// Nothing is kept on failure, so the next call retries.
    pub fn build(&self) -> Result<Arc<DispatchBus>, DispatchError> {
        if let Some(bus) = self.bus.load_full() {
            return Ok(bus);
        }
        let _guard = self.build_lock.lock();
        if let Some(bus) = self.bus.load_full() {
            return Ok(bus);
        }

        let started = Instant::now();
        let dependencies = self.dependencies.freeze();
        let name: Arc<str> = Arc::from(self.config.name.as_str());
        let trace = self.config.trace_filter();
        let layer = |kind, log, on_error: &Option<ErrorHandler>| Layer {
            kind,
            dispatcher: name.clone(),
            log,
            trace: trace.clone(),
            on_error: on_error.clone(),
        };
        let plan = BuildPlan {
            dependencies: &dependencies,
            store: &self.store,
            operation_layer: layer(HandlerKind::Operation, self.config.logs_operations(), &self.on_operation_error),
            orchestrator_layer: layer(
                HandlerKind::Orchestrator,
                self.config.logs_orchestrators(),
                &self.on_orchestrator_error,
            ),
            on_error: self.on_error.clone(),
        };

        let bus = match self.handlers.instantiate(plan) {
            Ok(bus) => Arc::new(bus),
            Err(err) => {
                tracing::error!(dispatcher = %self.config.name, error = %err, "dispatcher build failed");
                return Err(err);
            }
        };
        self.bus.store(Some(bus.clone()));
        tracing::info!(
            dispatcher = %self.config.name,
            handlers = self.handlers.len(),
            dependencies = dependencies.len(),
            middlewares = self.pipeline.len(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "dispatcher built"
        );
        Ok(bus)
    }

    /// Drop the built facade; the next call rebuilds from the registries.
    pub fn teardown(&self) {
        if self.bus.swap(None).is_some() {
            tracing::info!(dispatcher = %self.config.name, "dispatcher torn down");
        }
    }

    // -- dispatch -----------------------------------------------------------

    /// Run `command` through the pipeline and its handler.
    ///
    /// # Errors
    ///
    /// Returns the handler or middleware error, enriched with the active context
    /// snapshot when a context scope is open.
    pub fn call(&self, command: impl Record) -> Result<BoxRecord, DispatchError> {
        self.call_boxed(Box::new(command))
    }

    /// Typed variant of [`Dispatcher::call`]. `R` only downcasts the result; it
    /// plays no part in routing.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::call`], plus [`DispatchError::UnexpectedRecord`] when the
    /// result is not an `R`.
    pub fn call_as<R: Record>(&self, command: impl Record) -> Result<R, DispatchError> {
        downcast_output(self.call(command)?)
    }

    /// Dispatch an already erased command.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call`].
    pub fn call_boxed(&self, command: BoxRecord) -> Result<BoxRecord, DispatchError> {
        let result = self.build().and_then(|bus| {
            self.pipeline
                .execute(command, self.store.current(), |command| bus.execute_boxed(command))
        });
        result.map_err(|err| {
            if self.store.is_active() {
                err.attach_context(self.store.error_context())
            } else {
                err
            }
        })
    }

    // -- context ------------------------------------------------------------

    /// Open a context scope on the current thread; handlers invoked while the
    /// guard lives see `attributes`.
    ///
    /// # Errors
    ///
    /// Returns a [`ContextError`] if an attribute violates the configured limits.
    pub fn context(&self, attributes: Attributes) -> Result<ContextScope, ContextError> {
        self.store.enter(attributes)
    }

    /// The dispatcher's context store, for task scopes and direct reads.
    #[must_use]
    pub fn context_store(&self) -> &ContextStore {
        &self.store
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
