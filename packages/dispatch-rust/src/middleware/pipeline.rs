//! Pipeline composition: runs the middleware chain around a dispatch call.
//!
//! Per call: `PRE -> MAIN -> POST` on success, `PRE -> MAIN -> ERROR` when the
//! handler fails, `PRE -> ERROR` when a pre-phase middleware aborts. Pre runs in
//! ascending priority, post and error in descending priority, so priority 10
//! wraps priority 20 wraps the handler.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use switchyard_core::{Attributes, BoxRecord, Principal, Value};
use uuid::Uuid;

use crate::error::DispatchError;

// ---------------------------------------------------------------------------
// CallContext
// ---------------------------------------------------------------------------

/// Per-call state shared by every middleware of one pipeline run.
#[derive(Debug)]
pub struct CallContext {
    command: BoxRecord,
    execution_id: Uuid,
    started_at: Instant,
    attributes: Attributes,
    metadata: BTreeMap<String, Value>,
    principal: Option<Principal>,
    response: Option<BoxRecord>,
}

impl CallContext {
    #[must_use]
    pub fn new(command: BoxRecord, attributes: Attributes) -> Self {
        Self {
            command,
            execution_id: Uuid::new_v4(),
            started_at: Instant::now(),
            attributes,
            metadata: BTreeMap::new(),
            principal: None,
            response: None,
        }
    }

    /// The command as it will reach the handler.
    #[must_use]
    pub fn command(&self) -> &BoxRecord {
        &self.command
    }

    #[must_use]
    pub fn command_type(&self) -> &'static str {
        self.command.type_name()
    }

    /// Swap the command for a transformed one. Routing follows the new record's
    /// type name.
    pub fn replace_command(&mut self, command: BoxRecord) -> BoxRecord {
        std::mem::replace(&mut self.command, command)
    }

    #[must_use]
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Context-store attributes active when the call entered the pipeline.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = Some(principal);
    }

    /// Supply the result during the pre-phase. The handler is skipped and the
    /// post-phase runs over `response`.
    pub fn respond_with(&mut self, response: BoxRecord) {
        self.response = Some(response);
    }

    #[must_use]
    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }
}

// ---------------------------------------------------------------------------
// Middleware trait
// ---------------------------------------------------------------------------

/// Interceptor wrapped around every dispatch call.
///
/// Middlewares hold configuration only; per-call state belongs in the
/// [`CallContext`] metadata.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Lower runs earlier in the pre-phase and later in the post-phase.
    fn priority(&self) -> i32 {
        100
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Whether this middleware takes part in the call at all.
    fn should_execute(&self, _cx: &CallContext) -> bool {
        self.enabled()
    }

    /// Inspect or transform the call before the handler runs.
    ///
    /// # Errors
    ///
    /// An error aborts the call and starts the error phase.
    fn pre_execute(&self, _cx: &mut CallContext) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Inspect or transform the handler's result.
    ///
    /// # Errors
    ///
    /// An error starts the error phase.
    fn post_execute(&self, _cx: &CallContext, result: BoxRecord) -> Result<BoxRecord, DispatchError> {
        Ok(result)
    }

    /// Offer a substitute result for `error`. `None` declines.
    fn on_error(&self, _cx: &CallContext, _error: &DispatchError) -> Option<BoxRecord> {
        None
    }
}

// ---------------------------------------------------------------------------
// MiddlewarePipeline
// ---------------------------------------------------------------------------

/// Flat list of middlewares kept sorted by priority (stable for ties).
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.middlewares.iter().map(|m| (m.name(), m.priority())))
            .finish()
    }
}

impl MiddlewarePipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: impl Middleware) {
        self.add_shared(Arc::new(middleware));
    }

    /// Add a middleware the caller keeps a handle to (e.g. for cache invalidation).
    pub fn add_shared(&mut self, middleware: Arc<dyn Middleware>) {
        let priority = middleware.priority();
        let at = self.middlewares.partition_point(|m| m.priority() <= priority);
        tracing::debug!(middleware = middleware.name(), priority, "added middleware");
        self.middlewares.insert(at, middleware);
    }

    /// Middleware names in pre-phase order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.middlewares.iter().map(|m| m.name())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run `command` through the chain, calling `main` for the handler step.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a middleware or by `main`, unless an
    /// error-phase middleware substitutes a result for a recoverable error.
    pub fn execute<F>(&self, command: BoxRecord, attributes: Attributes, main: F) -> Result<BoxRecord, DispatchError>
    where
        F: FnOnce(BoxRecord) -> Result<BoxRecord, DispatchError>,
    {
        let mut cx = CallContext::new(command, attributes);
        match self.run(&mut cx, main) {
            Ok(result) => Ok(result),
            Err(err) => self.handle_error(&cx, err),
        }
    }

    fn run<F>(&self, cx: &mut CallContext, main: F) -> Result<BoxRecord, DispatchError>
    where
        F: FnOnce(BoxRecord) -> Result<BoxRecord, DispatchError>,
    {
        for middleware in &self.middlewares {
            if middleware.should_execute(cx) {
                middleware.pre_execute(cx)?;
            }
        }

        let mut result = match cx.response.take() {
            Some(response) => response,
            None => main(cx.command.clone())?,
        };

        for middleware in self.middlewares.iter().rev() {
            if middleware.should_execute(cx) {
                result = middleware.post_execute(cx, result)?;
            }
        }
        Ok(result)
    }

    fn handle_error(&self, cx: &CallContext, err: DispatchError) -> Result<BoxRecord, DispatchError> {
        let recoverable = err.is_recoverable();
        for middleware in self.middlewares.iter().rev() {
            if !middleware.should_execute(cx) {
                continue;
            }
            if let Some(substitute) = middleware.on_error(cx, &err) {
                if recoverable {
                    tracing::debug!(
                        middleware = middleware.name(),
                        execution_id = %cx.execution_id,
                        error = %err,
                        "error recovered by middleware"
                    );
                    return Ok(substitute);
                }
                tracing::warn!(
                    middleware = middleware.name(),
                    error = %err,
                    "ignoring substitute result for non-recoverable error"
                );
            }
        }
        Err(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
