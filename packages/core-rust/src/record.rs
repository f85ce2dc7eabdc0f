//! Structured records: the commands and results that travel through the dispatcher.
//!
//! A record is identified by its declared type name, which must be unique across a
//! dispatcher since it is the registry key. The dispatcher only ever needs three
//! things from a record: its type name, self-validation and field enumeration.
//! Everything else about the shape of a record belongs to the application.

use std::any::Any;
use std::fmt;

use serde::Serialize;

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A single failed field constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

/// Raised when a record fails its own validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {record}: {}", render_violations(.violations))]
pub struct ValidationError {
    /// Type name of the record that failed validation.
    pub record: &'static str,
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    #[must_use]
    pub fn new(record: &'static str) -> Self {
        Self {
            record,
            violations: Vec::new(),
        }
    }

    /// Shorthand for a single-violation error.
    #[must_use]
    pub fn field(record: &'static str, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(record).with_violation(field, message)
    }

    #[must_use]
    pub fn with_violation(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.violations.push(FieldViolation {
            field: field.into(),
            message: message.into(),
        });
        self
    }
}

fn render_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Record / DynRecord
// ---------------------------------------------------------------------------

/// A self-validating data record identified by a unique type name.
///
/// ```
/// use serde::Serialize;
/// use switchyard_core::{Record, ValidationError};
///
/// #[derive(Debug, Clone, Serialize)]
/// struct Deposit {
///     amount: i64,
/// }
///
/// impl Record for Deposit {
///     const TYPE_NAME: &'static str = "Deposit";
///
///     fn validate(&self) -> Result<(), ValidationError> {
///         if self.amount <= 0 {
///             return Err(ValidationError::field(Self::TYPE_NAME, "amount", "must be positive"));
///         }
///         Ok(())
///     }
/// }
///
/// assert!(Deposit { amount: 0 }.validated().is_err());
/// ```
pub trait Record: fmt::Debug + Clone + Serialize + Send + Sync + 'static {
    /// Registry key. Must be unique among all records handled by one dispatcher.
    const TYPE_NAME: &'static str;

    /// Check the record's own invariants. Records are valid by default.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing every violated constraint.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Validating constructor helper: returns the record only if it is valid.
    ///
    /// # Errors
    ///
    /// Propagates the error from [`Record::validate`].
    fn validated(self) -> Result<Self, ValidationError> {
        self.validate()?;
        Ok(self)
    }
}

/// Object-safe view of a [`Record`], blanket-implemented for every record.
pub trait DynRecord: fmt::Debug + Send + Sync + 'static {
    /// The record's declared type name.
    fn type_name(&self) -> &'static str;

    /// See [`Record::validate`].
    ///
    /// # Errors
    ///
    /// Returns the record's [`ValidationError`].
    fn validate(&self) -> Result<(), ValidationError>;

    /// The record's fields as a JSON value (an object for structs with named fields).
    ///
    /// # Errors
    ///
    /// Returns an error if the record's `Serialize` impl fails.
    fn fields(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn clone_box(&self) -> BoxRecord;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

/// Owned, type-erased record.
pub type BoxRecord = Box<dyn DynRecord>;

impl<T: Record> DynRecord for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Record::validate(self)
    }

    fn fields(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn clone_box(&self) -> BoxRecord {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl Clone for BoxRecord {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl dyn DynRecord {
    /// Whether the erased record is a `T`.
    #[must_use]
    pub fn is<T: Record>(&self) -> bool {
        self.as_any().is::<T>()
    }

    #[must_use]
    pub fn downcast_ref<T: Record>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recover the concrete record, handing the box back unchanged on mismatch.
    ///
    /// # Errors
    ///
    /// Returns the original box if the record is not a `T`.
    pub fn downcast<T: Record>(self: Box<Self>) -> Result<T, BoxRecord> {
        if !self.is::<T>() {
            return Err(self);
        }
        match self.into_any().downcast::<T>() {
            Ok(record) => Ok(*record),
            Err(_) => unreachable!("type checked above"),
        }
    }

    /// Names of the record's top-level fields, sorted.
    ///
    /// Records that do not serialize to an object (unit structs, newtypes) have none.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        match self.fields() {
            Ok(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Transfer {
        from: String,
        amount: i64,
    }

    impl Record for Transfer {
        const TYPE_NAME: &'static str = "Transfer";

        fn validate(&self) -> Result<(), ValidationError> {
            let mut err = ValidationError::new(Self::TYPE_NAME);
            if self.from.is_empty() {
                err = err.with_violation("from", "must not be empty");
            }
            if self.amount <= 0 {
                err = err.with_violation("amount", "must be positive");
            }
            if err.violations.is_empty() {
                Ok(())
            } else {
                Err(err)
            }
        }
    }

    #[derive(Debug, Clone, Serialize)]
    struct Ping;

    impl Record for Ping {
        const TYPE_NAME: &'static str = "Ping";
    }

    #[test]
    fn validated_rejects_invalid_record() {
        let err = Transfer {
            from: String::new(),
            amount: -1,
        }
        .validated()
        .unwrap_err();
        assert_eq!(err.record, "Transfer");
        assert_eq!(err.violations.len(), 2);
        assert_eq!(
            err.to_string(),
            "invalid Transfer: from: must not be empty; amount: must be positive"
        );
    }

    #[test]
    fn erased_record_reports_type_name_and_fields() {
        let boxed: BoxRecord = Box::new(Transfer {
            from: "acc-1".to_string(),
            amount: 5,
        });
        assert_eq!(boxed.type_name(), "Transfer");
        assert_eq!(boxed.field_names(), vec!["amount", "from"]);
        assert!(boxed.validate().is_ok());
    }

    #[test]
    fn unit_record_has_no_fields() {
        let boxed: BoxRecord = Box::new(Ping);
        assert!(boxed.field_names().is_empty());
    }

    #[test]
    fn downcast_round_trips_and_returns_box_on_mismatch() {
        let boxed: BoxRecord = Box::new(Ping);
        let back = boxed.downcast::<Transfer>().unwrap_err();
        assert_eq!(back.type_name(), "Ping");
        assert!(back.downcast::<Ping>().is_ok());
    }

    #[test]
    fn boxed_records_clone() {
        let boxed: BoxRecord = Box::new(Transfer {
            from: "a".to_string(),
            amount: 1,
        });
        let copy = boxed.clone();
        assert_eq!(
            copy.downcast_ref::<Transfer>(),
            boxed.downcast_ref::<Transfer>()
        );
    }
}
