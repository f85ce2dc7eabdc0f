//! Middleware pipeline and the built-in middlewares.
//!
//! - [`pipeline`]: `Middleware` trait, per-call `CallContext`, and the ordered chain
//! - [`validation`]: record self-validation plus business rules (priority 10)
//! - [`authorization`]: attribute-based access policies (priority 20)
//! - [`caching`]: result caching with tag invalidation (priority 30)
//! - [`metrics`]: call counts and durations via the `metrics` facade (priority 0)
//! - [`correlation`]: per-call correlation ids (priority 5)

pub mod authorization;
pub mod caching;
pub mod correlation;
pub mod metrics;
pub mod pipeline;
pub mod validation;

pub use authorization::{
    attribute_matches, has_permission, has_role, owns_resource, same_organization, AuthorizationError,
    AuthorizationMiddleware, AuthorizationPolicy, PermissionAction, PolicyContext,
};
pub use caching::{CacheConfig, CacheProvider, CachingMiddleware, InMemoryCacheProvider};
pub use correlation::CorrelationMiddleware;
pub use metrics::MetricsMiddleware;
pub use pipeline::{CallContext, Middleware, MiddlewarePipeline};
pub use validation::{BusinessRuleViolation, RuleViolation, Severity, ValidationMiddleware, ValidationRule};
