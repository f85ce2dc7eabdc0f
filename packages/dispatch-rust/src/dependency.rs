//! Dependency registry: named shared collaborators handed to handler factories.
//!
//! Dependencies are registered during bootstrap and frozen into a [`Dependencies`]
//! bundle when the dispatcher builds. Every handler factory receives the same
//! bundle; it picks the collaborators it needs by name and type.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DispatchError;

type Shared = Arc<dyn Any + Send + Sync>;

/// Mutable, bootstrap-time registry of named dependencies.
#[derive(Default)]
pub struct DependencyRegistry {
    entries: HashMap<String, Shared>,
    order: Vec<String>,
}

impl DependencyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under `name`. Names are never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DependencyAlreadyRegistered`] if `name` is taken.
    pub fn add<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) -> Result<(), DispatchError> {
        self.add_shared(name, Arc::new(value))
    }

    /// Register an already shared value, keeping the caller's `Arc` identity.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DependencyAlreadyRegistered`] if `name` is taken.
    pub fn add_shared<T: Any + Send + Sync>(
        &mut self,
        name: impl Into<String>,
        value: Arc<T>,
    ) -> Result<(), DispatchError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(DispatchError::DependencyAlreadyRegistered { name });
        }
        tracing::debug!(dependency = %name, ty = type_name::<T>(), "registering dependency");
        self.entries.insert(name.clone(), value);
        self.order.push(name);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot the registry into an immutable bundle.
    #[must_use]
    pub fn freeze(&self) -> Dependencies {
        Dependencies {
            entries: Arc::new(self.entries.clone()),
            order: Arc::new(self.order.clone()),
        }
    }
}

/// Immutable bundle of dependencies handed to handler factories at build time.
#[derive(Clone, Default)]
pub struct Dependencies {
    entries: Arc<HashMap<String, Shared>>,
    order: Arc<Vec<String>>,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies").field("names", &self.order).finish()
    }
}

impl Dependencies {
    /// Fetch the dependency registered under `name` as a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingDependency`] if nothing is registered under
    /// `name`, or [`DispatchError::DependencyTypeMismatch`] if it is not a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, DispatchError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| DispatchError::MissingDependency {
                name: name.to_string(),
            })?;
        entry
            .clone()
            .downcast::<T>()
            .map_err(|_| DispatchError::DependencyTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Like [`Dependencies::get`] but absent or mistyped entries yield `None`.
    #[must_use]
    pub fn try_get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).ok()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
