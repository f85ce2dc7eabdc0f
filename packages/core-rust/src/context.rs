//! Execution-scoped context store.
//!
//! A [`ContextStore`] holds a chain of frames per logical execution path. Entering a
//! scope pushes a frame whose attributes shadow the ones below it; dropping the
//! [`ContextScope`] guard removes exactly that frame. Chains live in task-local
//! storage while a future wrapped with [`ContextStore::scope`] is polled, and in
//! thread-local storage otherwise, so concurrent paths never observe each other's
//! attributes.
//!
//! Each store has its own identity: two stores on the same thread keep independent
//! chains.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{ClockSource, SystemClock};
use crate::types::{Attributes, Value};

type StoreId = u64;
type FrameId = u64;
type FrameMap = HashMap<StoreId, Vec<Arc<Frame>>>;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_FRAMES: RefCell<FrameMap> = RefCell::new(HashMap::new());
}

tokio::task_local! {
    static TASK_FRAMES: RefCell<FrameMap>;
}

// ---------------------------------------------------------------------------
// ContextConfig
// ---------------------------------------------------------------------------

/// Limits and defaults applied to every frame entered on a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Attributes seeded into root frames (frames without a parent).
    pub default_attributes: Attributes,
    /// If set, only these keys may be entered.
    pub allowed_keys: Option<BTreeSet<String>>,
    /// Restrict values to scalars (null, bool, numbers, strings).
    pub validate_types: bool,
    /// Maximum key length in bytes.
    pub max_key_length: usize,
    /// Maximum length in bytes of string values.
    pub max_value_length: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_attributes: Attributes::new(),
            allowed_keys: None,
            validate_types: true,
            max_key_length: 100,
            max_value_length: 1000,
        }
    }
}

impl ContextConfig {
    fn check(&self, key: &str, value: &Value) -> Result<(), ContextError> {
        if key.len() > self.max_key_length {
            return Err(ContextError::KeyTooLong {
                key: key.to_string(),
                max: self.max_key_length,
            });
        }
        if let Some(allowed) = &self.allowed_keys {
            if !allowed.contains(key) {
                return Err(ContextError::KeyNotAllowed {
                    key: key.to_string(),
                });
            }
        }
        if let Value::String(s) = value {
            if s.len() > self.max_value_length {
                return Err(ContextError::ValueTooLong {
                    key: key.to_string(),
                    max: self.max_value_length,
                });
            }
        }
        if self.validate_types && !value.is_scalar() {
            return Err(ContextError::UnsupportedValue {
                key: key.to_string(),
                kind: value.kind(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while entering or mutating a context scope.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("context key `{key}` exceeds maximum length of {max}")]
    KeyTooLong { key: String, max: usize },
    #[error("context key `{key}` is not in the allowed keys")]
    KeyNotAllowed { key: String },
    #[error("context value for `{key}` exceeds maximum length of {max}")]
    ValueTooLong { key: String, max: usize },
    #[error("context value for `{key}` has unsupported type {kind}")]
    UnsupportedValue { key: String, kind: &'static str },
    #[error("context scope is not the innermost open scope of its chain")]
    ScopeNotInnermost,
}

/// Snapshot of the active context at the moment an error escaped a scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorContext {
    /// Effective merged attributes of the innermost frame.
    pub attributes: Attributes,
    /// Nesting depth of the innermost frame (0 when no scope was open).
    pub depth: usize,
    /// Milliseconds since Unix epoch, read from the store's clock.
    pub timestamp_millis: u64,
}

/// Errors that can carry an [`ErrorContext`].
pub trait AttachContext {
    #[must_use]
    fn attach_context(self, context: ErrorContext) -> Self;
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Frame {
    id: FrameId,
    values: Attributes,
    /// Keys hidden from this frame down, even when an outer frame sets them.
    cleared: BTreeSet<String>,
}

impl Frame {
    fn new(values: Attributes) -> Self {
        Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            values,
            cleared: BTreeSet::new(),
        }
    }
}

/// Innermost-last lookup over a chain.
fn lookup<'a>(chain: &'a [Arc<Frame>], key: &str) -> Option<&'a Value> {
    for frame in chain.iter().rev() {
        if let Some(value) = frame.values.get(key) {
            return Some(value);
        }
        if frame.cleared.contains(key) {
            return None;
        }
    }
    None
}

fn flatten(chain: &[Arc<Frame>]) -> Attributes {
    let mut view = Attributes::new();
    for frame in chain {
        for key in &frame.cleared {
            view.remove(key);
        }
        view.extend(frame.values.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    view
}

/// Where a chain lives: the task map while a [`ContextStore::scope`] future is
/// being polled, the thread map otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Thread,
    Task,
}

impl Slot {
    fn active() -> Self {
        if TASK_FRAMES.try_with(|_| ()).is_ok() {
            Slot::Task
        } else {
            Slot::Thread
        }
    }

    /// `None` when the storage is gone (thread teardown, or a task-scoped guard
    /// used outside its task).
    fn with<R>(self, f: impl FnOnce(&mut FrameMap) -> R) -> Option<R> {
        match self {
            Slot::Thread => THREAD_FRAMES.try_with(|frames| f(&mut frames.borrow_mut())).ok(),
            Slot::Task => TASK_FRAMES.try_with(|frames| f(&mut frames.borrow_mut())).ok(),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// Handle to an execution-scoped key/value store. Cheap to clone; clones share
/// the same identity and therefore the same frames.
///
/// Outside a [`ContextStore::scope`] future, scopes belong to the thread: a guard
/// held across an `.await` is visible to every task polled on that thread until
/// it drops. Wrap each task with [`ContextStore::scope`] to give it a chain of
/// its own.
#[derive(Clone)]
pub struct ContextStore {
    id: StoreId,
    config: Arc<ContextConfig>,
    clock: Arc<dyn ClockSource>,
}

impl fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextStore")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl ContextStore {
    #[must_use]
    pub fn new(config: ContextConfig) -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used to timestamp [`ErrorContext`] snapshots.
    #[must_use]
    pub fn with_clock(mut self, clock: impl ClockSource + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Open a scope on the current execution path. The scope closes when the
    /// guard drops, in any order relative to other guards.
    ///
    /// # Errors
    ///
    /// Returns a [`ContextError`] if any attribute violates the store's [`ContextConfig`].
    pub fn enter(&self, attributes: Attributes) -> Result<ContextScope, ContextError> {
        let slot = Slot::active();
        let frame = self.new_frame(attributes, self.chain().is_empty())?;
        let depth = slot
            .with(|frames| {
                let chain = frames.entry(self.id).or_default();
                chain.push(frame.clone());
                chain.len()
            })
            .unwrap_or_default();
        tracing::debug!(
            depth,
            keys = ?frame.values.keys().collect::<Vec<_>>(),
            "context scope entered"
        );
        Ok(ContextScope {
            store: self.id,
            slot,
            config: self.config.clone(),
            frame,
            _not_send: PhantomData,
        })
    }

    /// Run `f` inside a scope. An error escaping `f` is enriched with the active
    /// attributes and a timestamp before the scope closes.
    ///
    /// # Errors
    ///
    /// Returns the error from entering the scope, or `f`'s own error.
    pub fn run<T, E, F>(&self, attributes: Attributes, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<ContextError> + AttachContext + fmt::Display,
    {
        let scope = self.enter(attributes)?;
        let result = f().map_err(|err| {
            let context = self.error_context();
            tracing::error!(
                error = %err,
                depth = context.depth,
                attributes = ?context.attributes,
                "error escaped context scope"
            );
            err.attach_context(context)
        });
        drop(scope);
        result
    }

    /// Wrap a future so that it, and everything it runs synchronously, observes a
    /// new frame. The caller's chains are captured when `scope` is called, so a
    /// future spawned onto another worker still inherits the caller's attributes.
    /// Scopes entered while the future is polled stay inside it.
    ///
    /// # Errors
    ///
    /// Returns a [`ContextError`] if any attribute violates the store's [`ContextConfig`].
    pub fn scope<F: Future>(
        &self,
        attributes: Attributes,
        future: F,
    ) -> Result<impl Future<Output = F::Output>, ContextError> {
        let mut frames = Slot::active().with(|frames| frames.clone()).unwrap_or_default();
        let chain = frames.entry(self.id).or_default();
        let frame = self.new_frame(attributes, chain.is_empty())?;
        chain.push(frame);
        Ok(TASK_FRAMES.scope(RefCell::new(frames), future))
    }

    /// Effective merged view of the innermost open frame.
    #[must_use]
    pub fn current(&self) -> Attributes {
        flatten(&self.chain())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        lookup(&self.chain(), key).cloned()
    }

    #[must_use]
    pub fn get_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.get(key).unwrap_or_else(|| default.into())
    }

    /// Number of open frames; 0 outside any scope.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.chain().len()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.chain().is_empty()
    }

    /// Snapshot used to enrich errors.
    #[must_use]
    pub fn error_context(&self) -> ErrorContext {
        let chain = self.chain();
        ErrorContext {
            attributes: flatten(&chain),
            depth: chain.len(),
            timestamp_millis: self.clock.now(),
        }
    }

    fn new_frame(&self, mut attributes: Attributes, root: bool) -> Result<Arc<Frame>, ContextError> {
        if root && !self.config.default_attributes.is_empty() {
            let mut seeded = self.config.default_attributes.clone();
            seeded.append(&mut attributes);
            attributes = seeded;
        }
        for (key, value) in &attributes {
            self.config.check(key, value)?;
        }
        Ok(Arc::new(Frame::new(attributes)))
    }

    fn chain(&self) -> Vec<Arc<Frame>> {
        Slot::active()
            .with(|frames| frames.get(&self.id).cloned())
            .flatten()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ContextScope
// ---------------------------------------------------------------------------

/// Guard for an open scope. Dropping it removes this scope's frame, and only
/// that frame, from the chain it was entered on.
///
/// The guard is `!Send`: it is bound to the thread or task whose chain it modified.
#[must_use = "the scope closes as soon as the guard is dropped"]
pub struct ContextScope {
    store: StoreId,
    slot: Slot,
    config: Arc<ContextConfig>,
    frame: Arc<Frame>,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("store", &self.store)
            .field("slot", &self.slot)
            .field("values", &self.frame.values)
            .finish_non_exhaustive()
    }
}

impl ContextScope {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        lookup(&self.prefix(), key).cloned()
    }

    /// Effective merged view of this scope's frame.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        flatten(&self.prefix())
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.prefix().len()
    }

    /// Set a key on this scope's frame. Only the innermost scope may be mutated.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::ScopeNotInnermost`] if a nested scope is open, or a
    /// validation error if the entry violates the store's [`ContextConfig`].
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), ContextError> {
        let key = key.into();
        let value = value.into();
        self.config.check(&key, &value)?;

        self.replace_innermost(|frame| {
            frame.cleared.remove(&key);
            frame.values.insert(key.clone(), value);
        })?;
        tracing::debug!(key = %key, "context key updated");
        Ok(())
    }

    /// Hide `key` from this scope and everything nested in it, including a value
    /// inherited from an outer scope. Returns whether the key was visible.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::ScopeNotInnermost`] if a nested scope is open.
    pub fn clear(&mut self, key: &str) -> Result<bool, ContextError> {
        let visible = self.get(key).is_some();
        self.replace_innermost(|frame| {
            if visible {
                frame.values.remove(key);
                frame.cleared.insert(key.to_string());
            }
        })?;
        if visible {
            tracing::debug!(key = %key, "context key cleared");
        }
        Ok(visible)
    }

    /// Frames up to and including this scope's own.
    fn prefix(&self) -> Vec<Arc<Frame>> {
        let id = self.frame.id;
        self.slot
            .with(|frames| {
                let chain = frames.get(&self.store)?;
                let at = chain.iter().position(|f| f.id == id)?;
                Some(chain[..=at].to_vec())
            })
            .flatten()
            .unwrap_or_else(|| vec![self.frame.clone()])
    }

    fn replace_innermost(&mut self, update: impl FnOnce(&mut Frame)) -> Result<(), ContextError> {
        let id = self.frame.id;
        let mut replacement = Frame {
            id,
            values: self.frame.values.clone(),
            cleared: self.frame.cleared.clone(),
        };
        update(&mut replacement);
        let replacement = Arc::new(replacement);

        self.slot
            .with(|frames| {
                let top = frames.get_mut(&self.store).and_then(|chain| chain.last_mut());
                match top {
                    Some(top) if top.id == id => {
                        *top = replacement.clone();
                        Ok(())
                    }
                    _ => Err(ContextError::ScopeNotInnermost),
                }
            })
            .unwrap_or(Err(ContextError::ScopeNotInnermost))?;
        self.frame = replacement;
        Ok(())
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let id = self.frame.id;
        let store = self.store;
        let depth = self.slot.with(|frames| {
            let chain = frames.get_mut(&store)?;
            let at = chain.iter().rposition(|f| f.id == id)?;
            chain.remove(at);
            if chain.is_empty() {
                frames.remove(&store);
            }
            Some(at + 1)
        });
        tracing::debug!(depth = ?depth.flatten(), "context scope exited");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
