//! Attribute-based authorization middleware.
//!
//! Each command type carries a list of policies; every condition of every
//! policy must hold for the principal making the call.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use switchyard_core::{DynRecord, Principal, Record, Value};

use super::pipeline::{CallContext, Middleware};
use crate::error::DispatchError;

/// Action a policy guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Create,
    Read,
    Update,
    Delete,
    Execute,
}

impl fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PermissionAction::Create => "create",
            PermissionAction::Read => "read",
            PermissionAction::Update => "update",
            PermissionAction::Delete => "delete",
            PermissionAction::Execute => "execute",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    #[error("no principal provider configured")]
    ProviderMissing,
    #[error("could not resolve principal: {0}")]
    Principal(anyhow::Error),
    #[error("access denied: policy `{policy}` failed for principal `{principal}`")]
    Denied { policy: String, principal: String },
}

/// What a condition gets to look at.
#[derive(Debug)]
pub struct PolicyContext<'a> {
    pub principal: &'a Principal,
    pub command: &'a dyn DynRecord,
    pub metadata: &'a BTreeMap<String, Value>,
    pub resource: &'a str,
    pub action: PermissionAction,
}

impl PolicyContext<'_> {
    /// A top-level string field of the command, if it has one.
    #[must_use]
    pub fn command_str(&self, field: &str) -> Option<String> {
        match self.command.fields().ok()?.get(field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

pub type Condition = Arc<dyn Fn(&PolicyContext<'_>) -> bool + Send + Sync>;

/// Extracts the caller's principal for a call.
pub type PrincipalProvider = Arc<dyn Fn(&CallContext) -> anyhow::Result<Principal> + Send + Sync>;

/// A named set of conditions guarding `action` on `resource`.
#[derive(Clone)]
pub struct AuthorizationPolicy {
    pub name: String,
    pub resource: String,
    pub action: PermissionAction,
    pub description: Option<String>,
    conditions: Vec<Condition>,
}

impl fmt::Debug for AuthorizationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationPolicy")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("action", &self.action)
            .field("conditions", &self.conditions.len())
            .finish_non_exhaustive()
    }
}

impl AuthorizationPolicy {
    #[must_use]
    pub fn new(name: impl Into<String>, resource: impl Into<String>, action: PermissionAction) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
            action,
            description: None,
            conditions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_condition(mut self, condition: impl Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static) -> Self {
        self.conditions.push(Arc::new(condition));
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn allows(&self, principal: &Principal, cx: &CallContext) -> bool {
        let policy_cx = PolicyContext {
            principal,
            command: cx.command().as_ref(),
            metadata: cx.metadata(),
            resource: &self.resource,
            action: self.action,
        };
        self.conditions.iter().all(|condition| condition(&policy_cx))
    }
}

// ---------------------------------------------------------------------------
// Condition helpers
// ---------------------------------------------------------------------------

pub fn has_role(role: impl Into<String>) -> impl Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static {
    let role = role.into();
    move |cx: &PolicyContext<'_>| cx.principal.roles.contains(&role)
}

pub fn has_permission(permission: impl Into<String>) -> impl Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static {
    let permission = permission.into();
    move |cx: &PolicyContext<'_>| cx.principal.permissions.contains(&permission)
}

/// The command's `user_id` field names the principal.
pub fn owns_resource() -> impl Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static {
    |cx: &PolicyContext<'_>| cx.command_str("user_id").is_some_and(|owner| owner == cx.principal.id)
}

/// The command's `organization_id` field matches the principal's organization.
pub fn same_organization() -> impl Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static {
    |cx: &PolicyContext<'_>| match (&cx.principal.organization_id, cx.command_str("organization_id")) {
        (Some(mine), Some(theirs)) => *mine == theirs,
        _ => false,
    }
}

pub fn attribute_matches(
    name: impl Into<String>,
    expected: impl Into<Value>,
) -> impl Fn(&PolicyContext<'_>) -> bool + Send + Sync + 'static {
    let name = name.into();
    let expected = expected.into();
    move |cx: &PolicyContext<'_>| cx.principal.attributes.get(&name) == Some(&expected)
}

// ---------------------------------------------------------------------------
// AuthorizationMiddleware
// ---------------------------------------------------------------------------

/// Checks the policies registered for the command type. Priority 20.
///
/// The resolved principal is stored on the [`CallContext`]; a successful check
/// sets the `authorization_passed` metadata flag.
#[derive(Default)]
pub struct AuthorizationMiddleware {
    provider: Option<PrincipalProvider>,
    policies: HashMap<&'static str, Vec<AuthorizationPolicy>>,
}

impl fmt::Debug for AuthorizationMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationMiddleware")
            .field("has_provider", &self.provider.is_some())
            .field("policies", &self.policies)
            .finish()
    }
}

impl AuthorizationMiddleware {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_principal_provider(
        mut self,
        provider: impl Fn(&CallContext) -> anyhow::Result<Principal> + Send + Sync + 'static,
    ) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn with_policy<C: Record>(mut self, policy: AuthorizationPolicy) -> Self {
        self.add_policy::<C>(policy);
        self
    }

    pub fn add_policy<C: Record>(&mut self, policy: AuthorizationPolicy) {
        self.policies.entry(C::TYPE_NAME).or_default().push(policy);
    }

    fn authorize(&self, cx: &mut CallContext) -> Result<(), AuthorizationError> {
        let provider = self.provider.as_ref().ok_or(AuthorizationError::ProviderMissing)?;
        let principal = provider(cx).map_err(AuthorizationError::Principal)?;

        if let Some(policies) = self.policies.get(cx.command_type()) {
            if let Some(denied) = policies.iter().find(|policy| !policy.allows(&principal, cx)) {
                tracing::warn!(
                    command = cx.command_type(),
                    policy = %denied.name,
                    principal = %principal.id,
                    "authorization denied"
                );
                return Err(AuthorizationError::Denied {
                    policy: denied.name.clone(),
                    principal: principal.id,
                });
            }
        }

        cx.set_principal(principal);
        cx.add_metadata("authorization_passed", true);
        Ok(())
    }
}

impl Middleware for AuthorizationMiddleware {
    fn name(&self) -> &str {
        "authorization"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn pre_execute(&self, cx: &mut CallContext) -> Result<(), DispatchError> {
        self.authorize(cx)
            .map_err(|err| DispatchError::middleware("authorization", err))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use switchyard_core::{attributes, Attributes};

    use super::*;

    #[derive(Debug, Clone, Serialize)]
    struct CloseAccount {
        user_id: String,
        organization_id: String,
    }

    impl Record for CloseAccount {
        const TYPE_NAME: &'static str = "CloseAccount";
    }

    fn command(user: &str, org: &str) -> CallContext {
        CallContext::new(
            Box::new(CloseAccount {
                user_id: user.to_string(),
                organization_id: org.to_string(),
            }),
            attributes! { "user" => user },
        )
    }

    fn from_context(cx: &CallContext) -> anyhow::Result<Principal> {
        let id = cx
            .attributes()
            .get("user")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("no user in context"))?;
        Ok(Principal::new(id)
            .with_role(if id == "root" { "admin" } else { "member" })
            .with_organization("acme"))
    }

    fn middleware() -> AuthorizationMiddleware {
        AuthorizationMiddleware::new()
            .with_principal_provider(from_context)
            .with_policy::<CloseAccount>(
                AuthorizationPolicy::new("owner-in-org", "account", PermissionAction::Delete)
                    .with_condition(owns_resource())
                    .with_condition(same_organization()),
            )
    }

    fn denial(err: DispatchError) -> AuthorizationError {
        match err {
            DispatchError::Middleware { source, .. } => source.downcast::<AuthorizationError>().unwrap(),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn owner_in_same_organization_is_allowed() {
        let mut cx = command("ada", "acme");
        middleware().pre_execute(&mut cx).unwrap();
        assert_eq!(cx.get_metadata("authorization_passed"), Some(&Value::Bool(true)));
        assert_eq!(cx.principal().map(|p| p.id.as_str()), Some("ada"));
    }

    #[test]
    fn non_owner_is_denied() {
        let mut cx = command("ada", "acme");
        cx.replace_command(Box::new(CloseAccount {
            user_id: "grace".into(),
            organization_id: "acme".into(),
        }));
        let err = denial(middleware().pre_execute(&mut cx).unwrap_err());
        assert!(matches!(
            err,
            AuthorizationError::Denied { ref policy, ref principal } if policy == "owner-in-org" && principal == "ada"
        ));
        assert!(cx.get_metadata("authorization_passed").is_none());
    }

    #[test]
    fn other_organization_is_denied() {
        let mut cx = command("ada", "globex");
        assert!(middleware().pre_execute(&mut cx).is_err());
    }

    #[test]
    fn missing_provider_and_unresolvable_principal_fail() {
        let mut cx = command("ada", "acme");
        let err = denial(AuthorizationMiddleware::new().pre_execute(&mut cx).unwrap_err());
        assert!(matches!(err, AuthorizationError::ProviderMissing));

        let mut anonymous = CallContext::new(
            Box::new(CloseAccount {
                user_id: "ada".into(),
                organization_id: "acme".into(),
            }),
            Attributes::new(),
        );
        let err = denial(middleware().pre_execute(&mut anonymous).unwrap_err());
        assert!(matches!(err, AuthorizationError::Principal(_)));
    }

    #[test]
    fn role_permission_and_attribute_helpers() {
        let principal = Principal::new("root")
            .with_role("admin")
            .with_permission("accounts:close")
            .with_attribute("region", "eu");
        let record = CloseAccount {
            user_id: "ada".into(),
            organization_id: "acme".into(),
        };
        let metadata = BTreeMap::new();
        let cx = PolicyContext {
            principal: &principal,
            command: &record,
            metadata: &metadata,
            resource: "account",
            action: PermissionAction::Delete,
        };

        assert!(has_role("admin")(&cx));
        assert!(!has_role("auditor")(&cx));
        assert!(has_permission("accounts:close")(&cx));
        assert!(attribute_matches("region", "eu")(&cx));
        assert!(!attribute_matches("region", "us")(&cx));
        assert!(!owns_resource()(&cx));
        assert!(!same_organization()(&cx));
    }
}
