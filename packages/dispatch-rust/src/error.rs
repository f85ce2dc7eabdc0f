use std::fmt;

use switchyard_core::{AttachContext, ContextError, ErrorContext, ValidationError};

use crate::handler::HandlerKind;

/// How a command type collided with an existing registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Registered twice as the same kind.
    SameKind(HandlerKind),
    /// Present as both an operation and an orchestrator.
    CrossKind,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::SameKind(kind) => write!(f, "already registered as an {kind}"),
            Conflict::CrossKind => f.write_str("registered as both an operation and an orchestrator"),
        }
    }
}

/// Errors returned by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("command type `{type_name}` is {conflict}")]
    DuplicateRegistration {
        type_name: &'static str,
        conflict: Conflict,
    },
    #[error("no handler registered for command type `{type_name}`")]
    UnknownCommand { type_name: &'static str },
    #[error("dependency `{name}` is already registered")]
    DependencyAlreadyRegistered { name: String },
    #[error("dependency `{name}` is not registered")]
    MissingDependency { name: String },
    #[error("dependency `{name}` is not a `{expected}`")]
    DependencyTypeMismatch { name: String, expected: &'static str },
    #[error("dispatcher is already built, registration is closed")]
    AlreadyBuilt,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("handler for `{type_name}` failed: {source}")]
    Handler {
        type_name: &'static str,
        source: anyhow::Error,
    },
    #[error("middleware `{name}` failed: {source}")]
    Middleware { name: String, source: anyhow::Error },
    #[error("expected a `{expected}` record, got a `{actual}`")]
    UnexpectedRecord {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{source}")]
    WithContext {
        source: Box<DispatchError>,
        context: ErrorContext,
    },
}

impl DispatchError {
    pub fn handler(type_name: &'static str, source: impl Into<anyhow::Error>) -> Self {
        DispatchError::Handler {
            type_name,
            source: source.into(),
        }
    }

    pub fn middleware(name: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        DispatchError::Middleware {
            name: name.into(),
            source: source.into(),
        }
    }

    /// The error with any context enrichment peeled off.
    #[must_use]
    pub fn root(&self) -> &DispatchError {
        match self {
            DispatchError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Context snapshot captured when the error escaped a scope, if any.
    #[must_use]
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            DispatchError::WithContext { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable short name of the root variant, recorded on execution spans.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self.root() {
            DispatchError::DuplicateRegistration { .. } => "duplicate_registration",
            DispatchError::UnknownCommand { .. } => "unknown_command",
            DispatchError::DependencyAlreadyRegistered { .. } => "dependency_already_registered",
            DispatchError::MissingDependency { .. } => "missing_dependency",
            DispatchError::DependencyTypeMismatch { .. } => "dependency_type_mismatch",
            DispatchError::AlreadyBuilt => "already_built",
            DispatchError::Validation(_) => "validation",
            DispatchError::Context(_) => "context",
            DispatchError::Handler { .. } => "handler",
            DispatchError::Middleware { .. } => "middleware",
            DispatchError::UnexpectedRecord { .. } => "unexpected_record",
            DispatchError::WithContext { source, .. } => source.code(),
        }
    }

    /// Programming mistakes detected while composing the dispatcher.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root(),
            DispatchError::DuplicateRegistration { .. }
                | DispatchError::DependencyAlreadyRegistered { .. }
                | DispatchError::MissingDependency { .. }
                | DispatchError::DependencyTypeMismatch { .. }
                | DispatchError::AlreadyBuilt
        )
    }

    /// Whether an error handler or middleware may replace this error with a result.
    ///
    /// Configuration errors and unknown commands always reach the caller.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !self.is_configuration() && !matches!(self.root(), DispatchError::UnknownCommand { .. })
    }
}

impl AttachContext for DispatchError {
    fn attach_context(self, context: ErrorContext) -> Self {
        match self {
            // The innermost snapshot is the most precise one; keep it.
            enriched @ DispatchError::WithContext { .. } => enriched,
            other => DispatchError::WithContext {
                source: Box::new(other),
                context,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::attributes;

    use super::*;

    fn snapshot(depth: usize) -> ErrorContext {
        ErrorContext {
            attributes: attributes! { "tenant" => "acme" },
            depth,
            timestamp_millis: 0,
        }
    }

    #[test]
    fn enrichment_is_transparent_to_classification() {
        let err = DispatchError::UnknownCommand { type_name: "Nope" }.attach_context(snapshot(1));
        assert!(matches!(err.root(), DispatchError::UnknownCommand { type_name: "Nope" }));
        assert_eq!(err.context().map(|c| c.depth), Some(1));
        assert!(!err.is_recoverable());
        assert_eq!(err.code(), "unknown_command");
        assert_eq!(err.to_string(), "no handler registered for command type `Nope`");
    }

    #[test]
    fn first_snapshot_wins() {
        let err = DispatchError::handler("Ping", anyhow::anyhow!("down"))
            .attach_context(snapshot(3))
            .attach_context(snapshot(1));
        assert_eq!(err.context().map(|c| c.depth), Some(3));
        assert!(err.is_recoverable());
    }

    #[test]
    fn configuration_errors_are_not_recoverable() {
        let dup = DispatchError::DuplicateRegistration {
            type_name: "Ping",
            conflict: Conflict::CrossKind,
        };
        assert!(dup.is_configuration());
        assert!(!dup.is_recoverable());
        assert_eq!(
            dup.to_string(),
            "command type `Ping` is registered as both an operation and an orchestrator"
        );
        assert!(!DispatchError::AlreadyBuilt.is_recoverable());
    }

    #[test]
    fn execution_errors_are_recoverable() {
        let validation = DispatchError::from(ValidationError::field("Deposit", "amount", "must be positive"));
        assert!(validation.is_recoverable());
        assert!(DispatchError::middleware("auth", anyhow::anyhow!("denied")).is_recoverable());
    }
}
