//! Handler registry: one table keyed by command type name for both handler kinds.
//!
//! Registration stores a factory, not a handler. Factories run when the
//! dispatcher builds, after every dependency is known.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use switchyard_core::{ContextStore, Record};

use crate::bus::{DispatchBus, ErrorHandler, HandlerTable, Layer, OperationBus};
use crate::dependency::Dependencies;
use crate::error::{Conflict, DispatchError};
use crate::handler::{
    ErasedHandler, HandlerKind, Operation, OperationFactory, OperationHandler, Orchestrator,
    OrchestratorFactory, OrchestratorHandler,
};

/// A registered handler factory, tagged with its kind.
pub(crate) enum RegistryEntry {
    Operation(OperationFactory),
    Orchestrator(OrchestratorFactory),
}

impl RegistryEntry {
    fn kind(&self) -> HandlerKind {
        match self {
            RegistryEntry::Operation(_) => HandlerKind::Operation,
            RegistryEntry::Orchestrator(_) => HandlerKind::Orchestrator,
        }
    }
}

/// Everything [`HandlerRegistry::instantiate`] needs besides the factories.
pub(crate) struct BuildPlan<'a> {
    pub(crate) dependencies: &'a Dependencies,
    pub(crate) store: &'a ContextStore,
    pub(crate) operation_layer: Layer,
    pub(crate) orchestrator_layer: Layer,
    pub(crate) on_error: Option<ErrorHandler>,
}

/// Registry of handler factories keyed by command type name.
///
/// A type name maps to at most one entry across both kinds for the lifetime of
/// the registry; a second registration is rejected, never overwritten.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<&'static str, RegistryEntry>,
    order: Vec<&'static str>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.order.iter().filter_map(|name| Some((name, self.kind_of(name)?))))
            .finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation factory for `H::Command`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateRegistration`] if the command type is
    /// already registered as either kind.
    pub fn register_operation<H, F>(&mut self, factory: F) -> Result<(), DispatchError>
    where
        H: Operation,
        F: Fn(&Dependencies) -> Result<H, DispatchError> + Send + Sync + 'static,
    {
        let factory: OperationFactory =
            Box::new(move |deps: &Dependencies| -> Result<Box<dyn ErasedHandler>, DispatchError> {
                Ok(Box::new(OperationHandler(factory(deps)?)))
            });
        self.insert(<H::Command as Record>::TYPE_NAME, RegistryEntry::Operation(factory))
    }

    /// Register an orchestrator factory for `H::Command`. The factory receives
    /// the operation-only bus alongside the dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateRegistration`] if the command type is
    /// already registered as either kind.
    pub fn register_orchestrator<H, F>(&mut self, factory: F) -> Result<(), DispatchError>
    where
        H: Orchestrator,
        F: Fn(&Dependencies, OperationBus) -> Result<H, DispatchError> + Send + Sync + 'static,
    {
        let factory: OrchestratorFactory = Box::new(
            move |deps: &Dependencies, bus: OperationBus| -> Result<Box<dyn ErasedHandler>, DispatchError> {
                Ok(Box::new(OrchestratorHandler(factory(deps, bus)?)))
            },
        );
        self.insert(<H::Command as Record>::TYPE_NAME, RegistryEntry::Orchestrator(factory))
    }

    fn insert(&mut self, type_name: &'static str, entry: RegistryEntry) -> Result<(), DispatchError> {
        let kind = entry.kind();
        match self.entries.entry(type_name) {
            Entry::Occupied(existing) => {
                let conflict = if existing.get().kind() == kind {
                    Conflict::SameKind(kind)
                } else {
                    Conflict::CrossKind
                };
                Err(DispatchError::DuplicateRegistration { type_name, conflict })
            }
            Entry::Vacant(slot) => {
                tracing::debug!(command = type_name, kind = %kind, "registered handler");
                slot.insert(entry);
                self.order.push(type_name);
                Ok(())
            }
        }
    }

    /// The kind registered for `type_name`, if any.
    #[must_use]
    pub fn kind_of(&self, type_name: &str) -> Option<HandlerKind> {
        self.entries.get(type_name).map(RegistryEntry::kind)
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every factory and assemble the facade.
    ///
    /// Operations are instantiated first, in registration order, so the
    /// operation bus handed to orchestrator factories is complete.
    pub(crate) fn instantiate(&self, plan: BuildPlan<'_>) -> Result<DispatchBus, DispatchError> {
        let mut operations = HandlerTable::new();
        for name in &self.order {
            if let Some(RegistryEntry::Operation(factory)) = self.entries.get(name) {
                operations.insert(*name, factory(plan.dependencies)?);
            }
        }
        let bus = OperationBus::new(operations, plan.operation_layer, plan.store.clone());

        let mut orchestrators = HandlerTable::new();
        for name in &self.order {
            if let Some(RegistryEntry::Orchestrator(factory)) = self.entries.get(name) {
                orchestrators.insert(*name, factory(plan.dependencies, bus.clone())?);
            }
        }

        Ok(DispatchBus::new(bus, orchestrators, plan.orchestrator_layer, plan.on_error))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use serde::Serialize;

    use super::*;
    use crate::config::TraceFilter;
    use crate::dependency::DependencyRegistry;
    use crate::handler::HandlerContext;

    #[derive(Debug, Clone, Serialize)]
    struct Ping;

    impl Record for Ping {
        const TYPE_NAME: &'static str = "Ping";
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Pong {
        pong: bool,
        greeting: String,
    }

    impl Record for Pong {
        const TYPE_NAME: &'static str = "Pong";
    }

    struct PingHandler {
        greeting: Arc<String>,
    }

    impl Operation for PingHandler {
        type Command = Ping;
        type Output = Pong;

        fn execute(&self, _: Ping, _: &HandlerContext) -> anyhow::Result<Pong> {
            Ok(Pong {
                pong: true,
                greeting: self.greeting.to_string(),
            })
        }
    }

    struct PingFlow {
        bus: OperationBus,
    }

    impl Orchestrator for PingFlow {
        type Command = Ping;
        type Output = Pong;

        fn execute(&self, command: Ping, _: &HandlerContext) -> anyhow::Result<Pong> {
            Ok(self.bus.execute_as::<Pong>(command)?)
        }
    }

    fn ping_factory(deps: &Dependencies) -> Result<PingHandler, DispatchError> {
        Ok(PingHandler {
            greeting: deps.get("greeting")?,
        })
    }

    fn plan<'a>(dependencies: &'a Dependencies, store: &'a ContextStore) -> BuildPlan<'a> {
        let layer = |kind| Layer {
            kind,
            dispatcher: Arc::from("test"),
            log: false,
            trace: TraceFilter::Off,
            on_error: None,
        };
        BuildPlan {
            dependencies,
            store,
            operation_layer: layer(HandlerKind::Operation),
            orchestrator_layer: layer(HandlerKind::Orchestrator),
            on_error: None,
        }
    }

    #[test]
    fn same_kind_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_operation(ping_factory).unwrap();
        let err = registry.register_operation(ping_factory).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DuplicateRegistration {
                type_name: "Ping",
                conflict: Conflict::SameKind(HandlerKind::Operation)
            }
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cross_kind_registration_is_rejected_either_way() {
        let mut registry = HandlerRegistry::new();
        registry.register_operation(ping_factory).unwrap();
        let err = registry
            .register_orchestrator(|_, bus| Ok(PingFlow { bus }))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DuplicateRegistration {
                conflict: Conflict::CrossKind,
                ..
            }
        ));
        assert_eq!(registry.kind_of("Ping"), Some(HandlerKind::Operation));

        let mut registry = HandlerRegistry::new();
        registry.register_orchestrator(|_, bus| Ok(PingFlow { bus })).unwrap();
        assert!(registry.register_operation(ping_factory).is_err());
        assert_eq!(registry.kind_of("Ping"), Some(HandlerKind::Orchestrator));
    }

    #[test]
    fn instantiate_wires_dependencies_into_handlers() {
        let mut deps = DependencyRegistry::new();
        deps.add("greeting", "hi".to_string()).unwrap();
        deps.add("unused", 7_u8).unwrap();
        let deps = deps.freeze();
        let store = ContextStore::default();

        let mut registry = HandlerRegistry::new();
        registry.register_operation(ping_factory).unwrap();
        let bus = registry.instantiate(plan(&deps, &store)).unwrap();

        let pong = bus.operations().execute_as::<Pong>(Ping).unwrap();
        assert_eq!(
            pong,
            Pong {
                pong: true,
                greeting: "hi".to_string()
            }
        );
    }

    #[test]
    fn missing_dependency_fails_the_build() {
        let deps = Dependencies::default();
        let store = ContextStore::default();
        let mut registry = HandlerRegistry::new();
        registry.register_operation(ping_factory).unwrap();

        let err = registry.instantiate(plan(&deps, &store)).unwrap_err();
        assert!(matches!(err, DispatchError::MissingDependency { name } if name == "greeting"));
    }

    #[test]
    fn factories_run_once_per_instantiation() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut deps = DependencyRegistry::new();
        deps.add("greeting", "hi".to_string()).unwrap();
        let deps = deps.freeze();
        let store = ContextStore::default();

        let mut registry = HandlerRegistry::new();
        registry
            .register_operation(move |deps: &Dependencies| {
                counter.fetch_add(1, Ordering::SeqCst);
                ping_factory(deps)
            })
            .unwrap();

        let bus = registry.instantiate(plan(&deps, &store)).unwrap();
        for _ in 0..3 {
            bus.execute(Ping).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
