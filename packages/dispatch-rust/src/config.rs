use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use switchyard_core::ContextConfig;

/// Dispatcher-level configuration.
///
/// Controls the name used in log events, which execution layers emit
/// started/completed/failed events, and the context store limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Name of the bounded context this dispatcher serves; tagged on every log event.
    pub name: String,
    /// Master switch for execution log events. When false, nothing is logged per call.
    pub log_executions: bool,
    /// Log operation executions. Ignored when `log_executions` is false.
    pub log_operations: bool,
    /// Log orchestrator executions. Ignored when `log_executions` is false.
    pub log_orchestrators: bool,
    /// Open an `execute` span around every handler invocation.
    pub trace_executions: bool,
    /// If set, only these command types get an execution span.
    pub traced_commands: Option<BTreeSet<String>>,
    /// Limits applied to the dispatcher's context store.
    pub context: ContextConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            name: "switchyard".to_string(),
            log_executions: true,
            log_operations: true,
            log_orchestrators: true,
            trace_executions: true,
            traced_commands: None,
            context: ContextConfig::default(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub(crate) fn logs_operations(&self) -> bool {
        self.log_executions && self.log_operations
    }

    pub(crate) fn logs_orchestrators(&self) -> bool {
        self.log_executions && self.log_orchestrators
    }

    pub(crate) fn trace_filter(&self) -> TraceFilter {
        match (&self.traced_commands, self.trace_executions) {
            (_, false) => TraceFilter::Off,
            (None, true) => TraceFilter::All,
            (Some(commands), true) => TraceFilter::Only(Arc::new(commands.clone())),
        }
    }
}

/// Which command types get an execution span.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TraceFilter {
    Off,
    All,
    Only(Arc<BTreeSet<String>>),
}

impl TraceFilter {
    pub(crate) fn traces(&self, command: &str) -> bool {
        match self {
            TraceFilter::Off => false,
            TraceFilter::All => true,
            TraceFilter::Only(commands) => commands.contains(command),
        }
    }
}
