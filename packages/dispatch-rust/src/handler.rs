//! Handler capabilities: atomic operations and orchestrators.

use std::fmt;

use switchyard_core::{Attributes, BoxRecord, Record, Value};

use crate::bus::OperationBus;
use crate::error::DispatchError;

// ---------------------------------------------------------------------------
// HandlerKind
// ---------------------------------------------------------------------------

/// The two handler tiers. Operations are resolved before orchestrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Operation,
    Orchestrator,
}

impl HandlerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Operation => "operation",
            HandlerKind::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// Per-invocation view handed to a handler: the context attributes active when
/// the handler was invoked, plus what is being executed.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    command_type: &'static str,
    kind: HandlerKind,
    attributes: Attributes,
}

impl HandlerContext {
    pub(crate) fn new(command_type: &'static str, kind: HandlerKind, attributes: Attributes) -> Self {
        Self {
            command_type,
            kind,
            attributes,
        }
    }

    #[must_use]
    pub fn command_type(&self) -> &'static str {
        self.command_type
    }

    #[must_use]
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    #[must_use]
    pub fn get_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.get(key).cloned().unwrap_or_else(|| default.into())
    }

    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Atomic, single-purpose handler with no knowledge of other handlers.
///
/// Operations are built once per dispatcher by a factory that receives the
/// dependency bundle, then shared by every call.
pub trait Operation: Send + Sync + 'static {
    type Command: Record;
    type Output: Record;

    /// Execute the business logic for one command.
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller as [`DispatchError::Handler`].
    fn execute(&self, command: Self::Command, cx: &HandlerContext) -> anyhow::Result<Self::Output>;
}

/// Handler that coordinates several operations.
///
/// Orchestrators receive an [`OperationBus`] at construction. That bus resolves
/// operations only, so an orchestrator can never dispatch another orchestrator.
pub trait Orchestrator: Send + Sync + 'static {
    type Command: Record;
    type Output: Record;

    /// Execute the orchestration for one command.
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller as [`DispatchError::Handler`].
    fn execute(&self, command: Self::Command, cx: &HandlerContext) -> anyhow::Result<Self::Output>;
}

// ---------------------------------------------------------------------------
// Type erasure
// ---------------------------------------------------------------------------

/// Object-safe handler stored in the built tables.
pub(crate) trait ErasedHandler: Send + Sync {
    fn call(&self, command: BoxRecord, cx: &HandlerContext) -> Result<BoxRecord, DispatchError>;
}

fn unbox<C: Record>(command: BoxRecord) -> Result<C, DispatchError> {
    command.downcast::<C>().map_err(|other| DispatchError::UnexpectedRecord {
        expected: C::TYPE_NAME,
        actual: other.type_name(),
    })
}

/// Wrapper to type-erase a concrete [`Operation`].
pub(crate) struct OperationHandler<H>(pub(crate) H);

impl<H: Operation> ErasedHandler for OperationHandler<H> {
    fn call(&self, command: BoxRecord, cx: &HandlerContext) -> Result<BoxRecord, DispatchError> {
        let command = unbox::<H::Command>(command)?;
        match self.0.execute(command, cx) {
            Ok(output) => Ok(Box::new(output)),
            Err(source) => Err(DispatchError::handler(H::Command::TYPE_NAME, source)),
        }
    }
}

/// Wrapper to type-erase a concrete [`Orchestrator`].
pub(crate) struct OrchestratorHandler<H>(pub(crate) H);

impl<H: Orchestrator> ErasedHandler for OrchestratorHandler<H> {
    fn call(&self, command: BoxRecord, cx: &HandlerContext) -> Result<BoxRecord, DispatchError> {
        let command = unbox::<H::Command>(command)?;
        match self.0.execute(command, cx) {
            Ok(output) => Ok(Box::new(output)),
            Err(source) => Err(DispatchError::handler(H::Command::TYPE_NAME, source)),
        }
    }
}

/// Factories a dispatcher calls at build time to instantiate handlers.
pub(crate) type OperationFactory =
    Box<dyn Fn(&crate::Dependencies) -> Result<Box<dyn ErasedHandler>, DispatchError> + Send + Sync>;

pub(crate) type OrchestratorFactory = Box<
    dyn Fn(&crate::Dependencies, OperationBus) -> Result<Box<dyn ErasedHandler>, DispatchError>
        + Send
        + Sync,
>;
