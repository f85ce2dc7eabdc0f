//! Validation middleware: record self-validation plus per-type business rules.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use switchyard_core::{DynRecord, Record, Value};

use super::pipeline::{CallContext, Middleware};
use crate::error::DispatchError;

/// How much a failed rule matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// A single failed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleViolation {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
}

impl From<&RuleViolation> for Value {
    fn from(violation: &RuleViolation) -> Self {
        Value::Map(
            [
                ("rule".to_string(), Value::from(violation.rule.as_str())),
                ("severity".to_string(), Value::from(violation.severity.as_str())),
                ("message".to_string(), Value::from(violation.message.as_str())),
            ]
            .into_iter()
            .collect(),
        )
    }
}

/// Raised in strict mode when at least one error-severity rule fails.
#[derive(Debug, thiserror::Error)]
#[error("business rule validation failed: {}", summarize(.violations))]
pub struct BusinessRuleViolation {
    pub violations: Vec<RuleViolation>,
}

fn summarize(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} ({})", v.rule, v.message))
        .collect::<Vec<_>>()
        .join(", ")
}

type Check = Box<dyn Fn(&dyn DynRecord) -> anyhow::Result<bool> + Send + Sync>;

/// A named business rule for one command type.
pub struct ValidationRule {
    name: String,
    message: String,
    severity: Severity,
    check: Check,
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

impl ValidationRule {
    /// Error-severity rule; `check` returns whether `C` satisfies it.
    pub fn new<C: Record>(
        name: impl Into<String>,
        message: impl Into<String>,
        check: impl Fn(&C) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::try_new(name, message, move |command: &C| Ok(check(command)))
    }

    /// Rule whose check may itself fail. A failing check counts as an
    /// error-severity violation regardless of the rule's severity.
    pub fn try_new<C: Record>(
        name: impl Into<String>,
        message: impl Into<String>,
        check: impl Fn(&C) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            severity: Severity::Error,
            check: Box::new(move |record: &dyn DynRecord| match record.downcast_ref::<C>() {
                Some(command) => check(command),
                None => anyhow::bail!("expected a `{}` record, got a `{}`", C::TYPE_NAME, record.type_name()),
            }),
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, record: &dyn DynRecord) -> Option<RuleViolation> {
        match (self.check)(record) {
            Ok(true) => None,
            Ok(false) => Some(RuleViolation {
                rule: self.name.clone(),
                severity: self.severity,
                message: self.message.clone(),
            }),
            Err(err) => Some(RuleViolation {
                rule: self.name.clone(),
                severity: Severity::Error,
                message: format!("validation rule `{}` failed: {err}", self.name),
            }),
        }
    }
}

/// Runs the record's own `validate()` and then the rules registered for its
/// type. Priority 10.
///
/// In strict mode any error-severity violation aborts the call with
/// [`BusinessRuleViolation`]; otherwise violations are only recorded under the
/// `validation_errors` and `validation_warnings` metadata keys.
#[derive(Debug)]
pub struct ValidationMiddleware {
    name: String,
    strict: bool,
    rules: HashMap<&'static str, Vec<ValidationRule>>,
}

impl Default for ValidationMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationMiddleware {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "validation".to_string(),
            strict: true,
            rules: HashMap::new(),
        }
    }

    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn with_rule<C: Record>(mut self, rule: ValidationRule) -> Self {
        self.add_rule::<C>(rule);
        self
    }

    pub fn add_rule<C: Record>(&mut self, rule: ValidationRule) {
        self.rules.entry(C::TYPE_NAME).or_default().push(rule);
    }
}

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        10
    }

    fn pre_execute(&self, cx: &mut CallContext) -> Result<(), DispatchError> {
        cx.command().validate()?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        if let Some(rules) = self.rules.get(cx.command_type()) {
            for violation in rules.iter().filter_map(|rule| rule.evaluate(cx.command().as_ref())) {
                match violation.severity {
                    Severity::Error => errors.push(violation),
                    Severity::Warning => warnings.push(violation),
                    Severity::Info => {
                        tracing::debug!(rule = %violation.rule, message = %violation.message, "validation note");
                    }
                }
            }
        }

        if self.strict && !errors.is_empty() {
            return Err(DispatchError::middleware(
                self.name.as_str(),
                BusinessRuleViolation { violations: errors },
            ));
        }

        cx.add_metadata("validation_errors", errors.iter().map(Value::from).collect::<Vec<_>>());
        cx.add_metadata("validation_warnings", warnings.iter().map(Value::from).collect::<Vec<_>>());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
