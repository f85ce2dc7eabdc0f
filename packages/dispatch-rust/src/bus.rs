//! Buses: the built handler tables and the facade that resolves between them.
//!
//! [`OperationBus`] resolves operations only. It is the bus handed to
//! orchestrators, which keeps orchestrators from dispatching each other.
//! [`DispatchBus`] composes the operation bus with the orchestrator table and is
//! what the dispatcher calls once the middleware pre-phase is done.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use switchyard_core::{BoxRecord, ContextStore, Record};
use tracing::{field, Span};

use crate::config::TraceFilter;
use crate::error::{Conflict, DispatchError};
use crate::handler::{ErasedHandler, HandlerContext, HandlerKind};

/// Fallback invoked with a recoverable error; may return a substitute result.
pub type ErrorHandler = Arc<dyn Fn(DispatchError) -> Result<BoxRecord, DispatchError> + Send + Sync>;

pub(crate) type HandlerTable = HashMap<&'static str, Box<dyn ErasedHandler>>;

/// Unwrap a boxed result into the record type the caller expects.
pub(crate) fn downcast_output<R: Record>(output: BoxRecord) -> Result<R, DispatchError> {
    output.downcast::<R>().map_err(|other| DispatchError::UnexpectedRecord {
        expected: R::TYPE_NAME,
        actual: other.type_name(),
    })
}

/// Hand a recoverable error to `handler`. Anything else passes through.
pub(crate) fn recover(
    err: DispatchError,
    handler: Option<&ErrorHandler>,
    layer: &'static str,
) -> Result<BoxRecord, DispatchError> {
    match handler {
        Some(handler) if err.is_recoverable() => {
            tracing::debug!(layer, error = %err, "routing error to error handler");
            handler(err)
        }
        _ => Err(err),
    }
}

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// Per-kind execution settings: logging, tracing and the layer's error handler.
#[derive(Clone)]
pub(crate) struct Layer {
    pub(crate) kind: HandlerKind,
    pub(crate) dispatcher: Arc<str>,
    pub(crate) log: bool,
    pub(crate) trace: TraceFilter,
    pub(crate) on_error: Option<ErrorHandler>,
}

impl Layer {
    fn span(&self, command_type: &'static str) -> Span {
        if !self.trace.traces(command_type) {
            return Span::none();
        }
        tracing::info_span!(
            "execute",
            dispatcher = %self.dispatcher,
            bus = self.kind.as_str(),
            command = command_type,
            duration_ms = field::Empty,
            outcome = field::Empty,
            error_type = field::Empty,
        )
    }

    fn invoke(
        &self,
        handler: &dyn ErasedHandler,
        command: BoxRecord,
        store: &ContextStore,
    ) -> Result<BoxRecord, DispatchError> {
        let command_type = command.type_name();
        let cx = HandlerContext::new(command_type, self.kind, store.current());
        let span = self.span(command_type);
        let _entered = span.enter();
        if self.log {
            tracing::info!(
                dispatcher = %self.dispatcher,
                command = command_type,
                kind = %self.kind,
                "execution started"
            );
        }

        let started = Instant::now();
        let result = handler.call(command, &cx);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        span.record("duration_ms", duration_ms);

        match result {
            Ok(output) => {
                span.record("outcome", "ok");
                if self.log {
                    tracing::info!(
                        dispatcher = %self.dispatcher,
                        command = command_type,
                        kind = %self.kind,
                        duration_ms,
                        "execution completed"
                    );
                }
                Ok(output)
            }
            Err(err) => {
                span.record("outcome", "error");
                span.record("error_type", err.code());
                if self.log {
                    tracing::error!(
                        dispatcher = %self.dispatcher,
                        command = command_type,
                        kind = %self.kind,
                        duration_ms,
                        error = %err,
                        "execution failed"
                    );
                }
                recover(err, self.on_error.as_ref(), self.kind.as_str())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OperationBus
// ---------------------------------------------------------------------------

struct OperationTable {
    handlers: HandlerTable,
    layer: Layer,
    store: ContextStore,
}

/// Operation-only bus. Cheap to clone; all clones share the built table.
#[derive(Clone)]
pub struct OperationBus {
    inner: Arc<OperationTable>,
}

impl fmt::Debug for OperationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.inner.handlers.keys().collect();
        names.sort();
        f.debug_struct("OperationBus").field("operations", &names).finish()
    }
}

impl OperationBus {
    pub(crate) fn new(handlers: HandlerTable, layer: Layer, store: ContextStore) -> Self {
        Self {
            inner: Arc::new(OperationTable { handlers, layer, store }),
        }
    }

    /// Whether an operation is registered for `type_name`.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.inner.handlers.contains_key(type_name)
    }

    /// Number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.handlers.is_empty()
    }

    /// Execute `command` against the operation table.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownCommand`] if no operation handles the
    /// command (orchestrators are never consulted), or the handler's error.
    pub fn execute(&self, command: impl Record) -> Result<BoxRecord, DispatchError> {
        self.execute_boxed(Box::new(command))
    }

    /// Typed variant of [`OperationBus::execute`].
    ///
    /// # Errors
    ///
    /// As [`OperationBus::execute`], plus [`DispatchError::UnexpectedRecord`] if
    /// the result is not an `R`.
    pub fn execute_as<R: Record>(&self, command: impl Record) -> Result<R, DispatchError> {
        downcast_output(self.execute(command)?)
    }

    /// Execute an already erased command.
    ///
    /// # Errors
    ///
    /// See [`OperationBus::execute`].
    pub fn execute_boxed(&self, command: BoxRecord) -> Result<BoxRecord, DispatchError> {
        let type_name = command.type_name();
        let handler = self
            .inner
            .handlers
            .get(type_name)
            .ok_or(DispatchError::UnknownCommand { type_name })?;
        self.inner.layer.invoke(handler.as_ref(), command, &self.inner.store)
    }

    fn store(&self) -> &ContextStore {
        &self.inner.store
    }
}

// ---------------------------------------------------------------------------
// DispatchBus
// ---------------------------------------------------------------------------

/// Facade over both handler tables.
///
/// Resolution order: operation table, then orchestrator table. A type present
/// in both tables is reported as a conflict instead of being dispatched.
pub struct DispatchBus {
    operations: OperationBus,
    orchestrators: HandlerTable,
    layer: Layer,
    on_error: Option<ErrorHandler>,
}

impl fmt::Debug for DispatchBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut orchestrators: Vec<_> = self.orchestrators.keys().collect();
        orchestrators.sort();
        f.debug_struct("DispatchBus")
            .field("operations", &self.operations)
            .field("orchestrators", &orchestrators)
            .finish_non_exhaustive()
    }
}

impl DispatchBus {
    pub(crate) fn new(
        operations: OperationBus,
        orchestrators: HandlerTable,
        layer: Layer,
        on_error: Option<ErrorHandler>,
    ) -> Self {
        Self {
            operations,
            orchestrators,
            layer,
            on_error,
        }
    }

    /// The operation-only bus shared with orchestrators.
    #[must_use]
    pub fn operations(&self) -> &OperationBus {
        &self.operations
    }

    /// Which table, if any, handles `type_name`.
    #[must_use]
    pub fn kind_of(&self, type_name: &str) -> Option<HandlerKind> {
        if self.operations.contains(type_name) {
            Some(HandlerKind::Operation)
        } else if self.orchestrators.contains_key(type_name) {
            Some(HandlerKind::Orchestrator)
        } else {
            None
        }
    }

    /// Execute `command` against whichever table handles it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownCommand`] if neither table handles it,
    /// [`DispatchError::DuplicateRegistration`] if both do, or the handler's error.
    pub fn execute(&self, command: impl Record) -> Result<BoxRecord, DispatchError> {
        self.execute_boxed(Box::new(command))
    }

    /// Execute an already erased command.
    ///
    /// # Errors
    ///
    /// See [`DispatchBus::execute`].
    pub fn execute_boxed(&self, command: BoxRecord) -> Result<BoxRecord, DispatchError> {
        let type_name = command.type_name();
        let result = match (self.operations.contains(type_name), self.orchestrators.get(type_name)) {
            (true, Some(_)) => Err(DispatchError::DuplicateRegistration {
                type_name,
                conflict: Conflict::CrossKind,
            }),
            (true, None) => self.operations.execute_boxed(command),
            (false, Some(handler)) => self.layer.invoke(handler.as_ref(), command, self.operations.store()),
            (false, None) => Err(DispatchError::UnknownCommand { type_name }),
        };
        result.or_else(|err| recover(err, self.on_error.as_ref(), "global"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;
    use serde::Serialize;
    use tracing::span;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::registry::LookupSpan;

    use super::*;
    use crate::handler::{Operation, OperationHandler, Orchestrator, OrchestratorHandler};

    #[derive(Debug, Clone, Serialize)]
    struct Ping;

    impl Record for Ping {
        const TYPE_NAME: &'static str = "Ping";
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Pong {
        pong: bool,
    }

    impl Record for Pong {
        const TYPE_NAME: &'static str = "Pong";
    }

    #[derive(Debug, Clone, Serialize)]
    struct Boom;

    impl Record for Boom {
        const TYPE_NAME: &'static str = "Boom";
    }

    #[derive(Debug, Clone, Serialize)]
    struct Flow;

    impl Record for Flow {
        const TYPE_NAME: &'static str = "Flow";
    }

    struct PingHandler;

    impl Operation for PingHandler {
        type Command = Ping;
        type Output = Pong;

        fn execute(&self, _: Ping, _: &HandlerContext) -> anyhow::Result<Pong> {
            Ok(Pong { pong: true })
        }
    }

    struct BoomHandler;

    impl Operation for BoomHandler {
        type Command = Boom;
        type Output = Pong;

        fn execute(&self, _: Boom, _: &HandlerContext) -> anyhow::Result<Pong> {
            anyhow::bail!("boom")
        }
    }

    struct FlowHandler {
        bus: OperationBus,
    }

    impl Orchestrator for FlowHandler {
        type Command = Flow;
        type Output = Pong;

        fn execute(&self, _: Flow, _: &HandlerContext) -> anyhow::Result<Pong> {
            Ok(self.bus.execute_as::<Pong>(Ping)?)
        }
    }

    struct PingOrchestrator;

    impl Orchestrator for PingOrchestrator {
        type Command = Ping;
        type Output = Pong;

        fn execute(&self, _: Ping, _: &HandlerContext) -> anyhow::Result<Pong> {
            Ok(Pong { pong: false })
        }
    }

    fn layer(kind: HandlerKind, on_error: Option<ErrorHandler>) -> Layer {
        Layer {
            kind,
            dispatcher: Arc::from("test"),
            log: true,
            trace: TraceFilter::All,
            on_error,
        }
    }

    fn operation_bus(on_error: Option<ErrorHandler>) -> OperationBus {
        let mut handlers = HandlerTable::new();
        handlers.insert(Ping::TYPE_NAME, Box::new(OperationHandler(PingHandler)));
        handlers.insert(Boom::TYPE_NAME, Box::new(OperationHandler(BoomHandler)));
        OperationBus::new(handlers, layer(HandlerKind::Operation, on_error), ContextStore::default())
    }

    fn dispatch_bus(operations: OperationBus, orchestrators: HandlerTable) -> DispatchBus {
        DispatchBus::new(operations, orchestrators, layer(HandlerKind::Orchestrator, None), None)
    }

    #[test]
    fn orchestrator_reaches_operations_through_the_bus() {
        let operations = operation_bus(None);
        let mut orchestrators = HandlerTable::new();
        orchestrators.insert(
            Flow::TYPE_NAME,
            Box::new(OrchestratorHandler(FlowHandler { bus: operations.clone() })),
        );
        let bus = dispatch_bus(operations, orchestrators);

        let out = bus.execute(Flow).unwrap();
        assert_eq!(downcast_output::<Pong>(out).unwrap(), Pong { pong: true });
        assert_eq!(bus.kind_of("Flow"), Some(HandlerKind::Orchestrator));
        assert_eq!(bus.kind_of("Ping"), Some(HandlerKind::Operation));
    }

    #[test]
    fn operation_bus_never_resolves_orchestrators() {
        let operations = operation_bus(None);
        let mut orchestrators = HandlerTable::new();
        orchestrators.insert(
            Flow::TYPE_NAME,
            Box::new(OrchestratorHandler(FlowHandler { bus: operations.clone() })),
        );
        let bus = dispatch_bus(operations, orchestrators);

        let err = bus.operations().execute(Flow).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownCommand { type_name: "Flow" }));
    }

    #[test]
    fn type_in_both_tables_is_a_conflict_at_dispatch() {
        let mut orchestrators = HandlerTable::new();
        orchestrators.insert(Ping::TYPE_NAME, Box::new(OrchestratorHandler(PingOrchestrator)));
        let bus = dispatch_bus(operation_bus(None), orchestrators);

        let err = bus.execute(Ping).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DuplicateRegistration {
                type_name: "Ping",
                conflict: Conflict::CrossKind
            }
        ));
    }

    #[test]
    fn layer_error_handler_substitutes_execution_errors_only() {
        let on_error: ErrorHandler =
            Arc::new(|_: DispatchError| -> Result<BoxRecord, DispatchError> { Ok(Box::new(Pong { pong: false })) });
        let bus = dispatch_bus(operation_bus(Some(on_error)), HandlerTable::new());

        let out = bus.execute(Boom).unwrap();
        assert_eq!(downcast_output::<Pong>(out).unwrap(), Pong { pong: false });

        let err = bus.execute(Flow).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownCommand { .. }));
    }

    #[test]
    fn global_error_handler_sees_unrecovered_failures() {
        let global: ErrorHandler = Arc::new(|err: DispatchError| -> Result<BoxRecord, DispatchError> {
            match err.root() {
                DispatchError::Handler { .. } => Ok(Box::new(Pong { pong: true })),
                _ => Err(err),
            }
        });
        let bus = DispatchBus::new(
            operation_bus(None),
            HandlerTable::new(),
            layer(HandlerKind::Orchestrator, None),
            Some(global),
        );

        assert!(bus.execute(Boom).unwrap().is::<Pong>());
        assert!(matches!(
            bus.execute(Flow).unwrap_err(),
            DispatchError::UnknownCommand { type_name: "Flow" }
        ));
    }

    #[test]
    fn typed_result_mismatch_is_reported() {
        let bus = operation_bus(None);
        let err = bus.execute_as::<Ping>(Ping).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::UnexpectedRecord {
                expected: "Ping",
                actual: "Pong"
            }
        ));
    }

    #[derive(Debug, Default)]
    struct SpanFields(BTreeMap<String, String>);

    impl field::Visit for SpanFields {
        fn record_str(&mut self, field: &field::Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    /// Collects every closed span with its final field values.
    #[derive(Clone, Default)]
    struct ClosedSpans(Arc<Mutex<Vec<(String, BTreeMap<String, String>)>>>);

    impl<S> tracing_subscriber::Layer<S> for ClosedSpans
    where
        S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    {
        fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
            let mut fields = SpanFields::default();
            attrs.record(&mut fields);
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(fields);
            }
        }

        fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
            if let Some(span) = ctx.span(id) {
                if let Some(fields) = span.extensions_mut().get_mut::<SpanFields>() {
                    values.record(fields);
                }
            }
        }

        fn on_close(&self, id: span::Id, ctx: Context<'_, S>) {
            if let Some(span) = ctx.span(&id) {
                let fields = span.extensions_mut().remove::<SpanFields>().unwrap_or_default();
                self.0.lock().push((span.name().to_string(), fields.0));
            }
        }
    }

    #[test]
    fn executions_are_wrapped_in_spans() {
        let closed = ClosedSpans::default();
        let subscriber = tracing_subscriber::registry().with(closed.clone());
        tracing::subscriber::with_default(subscriber, || {
            let bus = operation_bus(None);
            bus.execute(Ping).unwrap();
            bus.execute(Boom).unwrap_err();
        });

        let spans = closed.0.lock();
        assert_eq!(spans.len(), 2);
        let (name, ok) = &spans[0];
        assert_eq!(name, "execute");
        assert_eq!(ok["command"], "Ping");
        assert_eq!(ok["bus"], "operation");
        assert_eq!(ok["outcome"], "ok");
        assert!(ok.contains_key("duration_ms"));
        assert!(!ok.contains_key("error_type"));

        let (_, failed) = &spans[1];
        assert_eq!(failed["command"], "Boom");
        assert_eq!(failed["outcome"], "error");
        assert_eq!(failed["error_type"], "handler");
    }

    #[test]
    fn untraced_commands_get_no_span() {
        let closed = ClosedSpans::default();
        let subscriber = tracing_subscriber::registry().with(closed.clone());
        let mut handlers = HandlerTable::new();
        handlers.insert(Ping::TYPE_NAME, Box::new(OperationHandler(PingHandler)));
        handlers.insert(Boom::TYPE_NAME, Box::new(OperationHandler(BoomHandler)));
        let layer = Layer {
            trace: TraceFilter::Only(Arc::new(["Boom".to_string()].into())),
            ..layer(HandlerKind::Operation, None)
        };
        let bus = OperationBus::new(handlers, layer, ContextStore::default());

        tracing::subscriber::with_default(subscriber, || {
            bus.execute(Ping).unwrap();
            bus.execute(Boom).unwrap_err();
        });

        let spans = closed.0.lock();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].1["command"], "Boom");
    }
}
