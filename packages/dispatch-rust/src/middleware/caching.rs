//! Result caching middleware with tag-based invalidation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use quick_cache::sync::Cache;
use switchyard_core::{BoxRecord, DynRecord, Record, Value};

use super::pipeline::{CallContext, Middleware};
use crate::error::DispatchError;

const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CAPACITY: usize = 10_000;

// ---------------------------------------------------------------------------
// CacheProvider
// ---------------------------------------------------------------------------

/// Storage backend for cached results.
pub trait CacheProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<BoxRecord>;

    fn set(&self, key: &str, value: BoxRecord, ttl: Duration);

    fn delete(&self, key: &str);

    /// Associate `key` with `tag` for later bulk invalidation.
    fn tag(&self, tag: &str, key: &str);

    fn delete_by_tag(&self, tag: &str);
}

#[derive(Clone)]
struct CacheEntry {
    value: BoxRecord,
    expires_at: Instant,
}

/// In-process provider: a bounded `quick_cache` plus a tag index.
///
/// Entries expire lazily on read. Keys the cache evicts on its own are swept
/// from a tag's set once that set grows past twice the cache capacity, so the
/// index stays proportional to the cache.
pub struct InMemoryCacheProvider {
    entries: Cache<String, CacheEntry>,
    tags: DashMap<String, HashSet<String>>,
    capacity: usize,
}

impl fmt::Debug for InMemoryCacheProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCacheProvider")
            .field("entries", &self.entries.len())
            .field("tags", &self.tags.len())
            .finish()
    }
}

impl Default for InMemoryCacheProvider {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryCacheProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Cache::new(capacity),
            tags: DashMap::new(),
            capacity,
        }
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

impl InMemoryCacheProvider {
    fn untag(&self, key: &str) {
        for mut keys in self.tags.iter_mut() {
            keys.remove(key);
        }
        self.tags.retain(|_, keys| !keys.is_empty());
    }
}

impl CacheProvider for InMemoryCacheProvider {
    fn get(&self, key: &str) -> Option<BoxRecord> {
        let entry = self.entries.get(key)?;
        if Instant::now() < entry.expires_at {
            return Some(entry.value);
        }
        self.entries.remove(key);
        self.untag(key);
        None
    }

    fn set(&self, key: &str, value: BoxRecord, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), entry);
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
        self.untag(key);
    }

    fn tag(&self, tag: &str, key: &str) {
        let mut keys = self.tags.entry(tag.to_string()).or_default();
        keys.insert(key.to_string());
        if keys.len() > self.capacity.saturating_mul(2) {
            keys.retain(|k| self.entries.peek(k.as_str()).is_some());
        }
    }

    fn delete_by_tag(&self, tag: &str) {
        if let Some((_, keys)) = self.tags.remove(tag) {
            for key in keys {
                self.entries.remove(&key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

type KeyFn = Arc<dyn Fn(&dyn DynRecord) -> String + Send + Sync>;
type ConditionFn = Arc<dyn Fn(&CallContext) -> bool + Send + Sync>;

/// Caching behavior for one command type.
#[derive(Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub tags: Vec<String>,
    key: Option<KeyFn>,
    condition: Option<ConditionFn>,
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("ttl", &self.ttl)
            .field("tags", &self.tags)
            .field("custom_key", &self.key.is_some())
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            tags: Vec::new(),
            key: None,
            condition: None,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Fn(&dyn DynRecord) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    /// Only cache calls for which `condition` holds.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Fn(&CallContext) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    fn key_for(&self, record: &dyn DynRecord) -> String {
        match &self.key {
            Some(key) => key(record),
            None => default_key(record),
        }
    }
}

/// `TypeName:<blake3 of the record's fields>`, falling back to the debug form
/// for records whose fields do not serialize.
#[must_use]
pub fn default_key(record: &dyn DynRecord) -> String {
    match record.fields().and_then(|fields| serde_json::to_vec(&fields)) {
        Ok(bytes) => format!("{}:{}", record.type_name(), blake3::hash(&bytes).to_hex()),
        Err(_) => format!("{}:{record:?}", record.type_name()),
    }
}

// ---------------------------------------------------------------------------
// CachingMiddleware
// ---------------------------------------------------------------------------

/// Serves repeated commands from a [`CacheProvider`]. Priority 30.
///
/// Only types configured through [`CachingMiddleware::configure`] are cached.
/// A hit skips the handler through [`CallContext::respond_with`]; metadata keys
/// `cache_key` and `cache_hit` describe what happened.
pub struct CachingMiddleware {
    provider: Arc<dyn CacheProvider>,
    configs: HashMap<&'static str, CacheConfig>,
}

impl fmt::Debug for CachingMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingMiddleware")
            .field("configs", &self.configs)
            .finish_non_exhaustive()
    }
}

impl Default for CachingMiddleware {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryCacheProvider::default()))
    }
}

impl CachingMiddleware {
    #[must_use]
    pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
        Self {
            provider,
            configs: HashMap::new(),
        }
    }

    #[must_use]
    pub fn configure<C: Record>(mut self, config: CacheConfig) -> Self {
        self.configs.insert(C::TYPE_NAME, config);
        self
    }

    /// Drop every entry cached under `tag`.
    pub fn invalidate(&self, tag: &str) {
        tracing::debug!(tag, "invalidating cache tag");
        self.provider.delete_by_tag(tag);
    }

    pub fn invalidate_key(&self, key: &str) {
        self.provider.delete(key);
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn CacheProvider> {
        &self.provider
    }
}

impl Middleware for CachingMiddleware {
    fn name(&self) -> &str {
        "caching"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn pre_execute(&self, cx: &mut CallContext) -> Result<(), DispatchError> {
        let Some(config) = self.configs.get(cx.command_type()) else {
            return Ok(());
        };
        if let Some(condition) = &config.condition {
            if !condition(cx) {
                return Ok(());
            }
        }

        let key = config.key_for(cx.command().as_ref());
        let cached = self.provider.get(&key);
        cx.add_metadata("cache_hit", cached.is_some());
        cx.add_metadata("cache_key", key);
        if let Some(cached) = cached {
            cx.respond_with(cached);
        }
        Ok(())
    }

    fn post_execute(&self, cx: &CallContext, result: BoxRecord) -> Result<BoxRecord, DispatchError> {
        if cx.get_metadata("cache_hit") != Some(&Value::Bool(false)) {
            return Ok(result);
        }
        let (Some(config), Some(key)) = (
            self.configs.get(cx.command_type()),
            cx.get_metadata("cache_key").and_then(Value::as_str),
        ) else {
            return Ok(result);
        };

        self.provider.set(key, result.clone(), config.ttl);
        for tag in &config.tags {
            self.provider.tag(tag, key);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
