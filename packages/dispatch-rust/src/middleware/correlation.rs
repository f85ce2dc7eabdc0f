//! Correlation middleware: every call carries a `correlation_id`.

use switchyard_core::Value;
use uuid::Uuid;

use super::pipeline::{CallContext, Middleware};
use crate::error::DispatchError;

pub const CORRELATION_ID: &str = "correlation_id";

/// Copies `correlation_id` from the context store into the call metadata, or
/// mints a fresh UUID v4 when the caller did not set one. Priority 5.
#[derive(Debug, Clone, Default)]
pub struct CorrelationMiddleware;

impl Middleware for CorrelationMiddleware {
    fn name(&self) -> &str {
        "correlation"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn pre_execute(&self, cx: &mut CallContext) -> Result<(), DispatchError> {
        let id = match cx.attributes().get(CORRELATION_ID) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        tracing::debug!(
            command = cx.command_type(),
            execution_id = %cx.execution_id(),
            correlation_id = %id,
            "correlated call"
        );
        cx.add_metadata(CORRELATION_ID, id);
        Ok(())
    }
}
