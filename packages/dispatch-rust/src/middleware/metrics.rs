//! Metrics middleware for dispatch calls.
//!
//! Records call counts and durations through the `metrics` facade. Installing a
//! recorder (Prometheus or otherwise) is left to the host process; without one
//! the macros are no-ops.

use switchyard_core::BoxRecord;

use super::pipeline::{CallContext, Middleware};
use crate::error::DispatchError;

pub const CALLS_TOTAL: &str = "switchyard_calls_total";
pub const CALL_DURATION_SECONDS: &str = "switchyard_call_duration_seconds";

/// Counts calls per command type and outcome and records their duration.
///
/// Runs at priority 0 so its timing covers every other middleware.
#[derive(Debug, Clone, Default)]
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    fn record(cx: &CallContext, outcome: &'static str) {
        let command = cx.command_type();
        metrics::counter!(CALLS_TOTAL, "command" => command, "outcome" => outcome).increment(1);
        metrics::histogram!(CALL_DURATION_SECONDS, "command" => command).record(cx.elapsed().as_secs_f64());
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn post_execute(&self, cx: &CallContext, result: BoxRecord) -> Result<BoxRecord, DispatchError> {
        Self::record(cx, "ok");
        Ok(result)
    }

    fn on_error(&self, cx: &CallContext, _error: &DispatchError) -> Option<BoxRecord> {
        Self::record(cx, "error");
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde::Serialize;
    use switchyard_core::{Attributes, Record};

    use super::*;
    use crate::middleware::MiddlewarePipeline;

    #[derive(Debug, Clone, Serialize)]
    struct Ping;

    impl Record for Ping {
        const TYPE_NAME: &'static str = "Ping";
    }

    #[test]
    fn metrics_middleware_passes_results_and_errors_through() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(MetricsMiddleware);

        let out = pipeline
            .execute(Box::new(Ping), Attributes::new(), |command| Ok(command))
            .unwrap();
        assert!(out.is::<Ping>());

        let err = pipeline
            .execute(Box::new(Ping), Attributes::new(), |_| {
                Err(DispatchError::handler("Ping", anyhow::anyhow!("down")))
            })
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler { .. }));
    }
}
