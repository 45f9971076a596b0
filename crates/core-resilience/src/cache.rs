//! Response cache with LRU eviction and per-entry TTL
//!
//! # Architecture
//!
//! ```text
//!   HashMap<String, SlotId> ──► slots: Vec<Option<Node>>
//!                                  │
//!   head ──► [A] ◄──► [B] ◄──► [C] ◄── tail
//!   (MRU)                          (LRU)
//! ```
//!
//! Nodes live in a slot arena and are linked by index into a recency list,
//! so lookup, bump and eviction are all O(1).
//!
//! The inner processor is invoked outside the lock. Two concurrent misses on
//! the same key both reach the inner processor and the last response to
//! arrive wins; there is no single-flight de-duplication.

use async_trait::async_trait;
use bulwark_core_processor::{CancellationToken, Message, Processor, Result};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Derives the cache key for a request
pub type KeyFn = Arc<dyn Fn(&Message) -> String + Send + Sync>;

/// Configuration for the response cache
#[derive(Clone)]
pub struct CacheConfig {
    /// Maximum number of resident entries
    pub max_size: usize,
    /// Time-to-live applied to every inserted entry
    pub default_ttl: Duration,
    /// Sweep all expired entries every this many requests
    pub sweep_interval: u64,
    /// Custom key derivation; `None` uses [`default_key`]
    pub key_fn: Option<KeyFn>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(300),
            sweep_interval: 100,
            key_fn: None,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("max_size", &self.max_size)
            .field("default_ttl", &self.default_ttl)
            .field("sweep_interval", &self.sweep_interval)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl CacheConfig {
    /// Use a custom key function
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Message) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Replace zero fields with their defaults
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            max_size: if self.max_size == 0 {
                defaults.max_size
            } else {
                self.max_size
            },
            default_ttl: if self.default_ttl.is_zero() {
                defaults.default_ttl
            } else {
                self.default_ttl
            },
            sweep_interval: if self.sweep_interval == 0 {
                defaults.sweep_interval
            } else {
                self.sweep_interval
            },
            key_fn: self.key_fn,
        }
    }
}

/// Stable key over role, content and metadata
///
/// Fields are length-prefixed before hashing so that no two distinct
/// messages share a byte stream.
pub fn default_key(message: &Message) -> String {
    let mut hasher = blake3::Hasher::new();
    let mut field = |bytes: &[u8]| {
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };
    field(message.role.as_bytes());
    field(message.content.as_bytes());
    for (key, value) in &message.metadata {
        field(key.as_bytes());
        field(value.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Point-in-time view of a cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    /// Entries removed to make room (LRU)
    pub evictions: u64,
    /// Entries removed because their TTL ran out
    pub expirations: u64,
    /// Resident entries when the snapshot was taken
    pub size: usize,
}

impl CacheMetrics {
    /// Fraction of lookups served from the cache
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

type SlotId = usize;

#[derive(Debug)]
struct Node {
    key: String,
    value: Message,
    created_at: Instant,
    expires_at: Instant,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

enum Lookup {
    Hit { value: Message, age: Duration },
    Expired,
    Miss,
}

/// Map plus recency list; not synchronized on its own
#[derive(Debug, Default)]
struct LruStore {
    index: HashMap<String, SlotId>,
    slots: Vec<Option<Node>>,
    free: Vec<SlotId>,
    /// Most recently used
    head: Option<SlotId>,
    /// Least recently used
    tail: Option<SlotId>,
}

impl LruStore {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&self, id: SlotId) -> &Node {
        self.slots[id].as_ref().expect("linked slot is occupied")
    }

    fn node_mut(&mut self, id: SlotId) -> &mut Node {
        self.slots[id].as_mut().expect("linked slot is occupied")
    }

    fn unlink(&mut self, id: SlotId) {
        let (prev, next) = {
            let node = self.node(id);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(id);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, id: SlotId) {
        let old_head = self.head;
        {
            let node = self.node_mut(id);
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
    }

    fn remove_slot(&mut self, id: SlotId) -> Node {
        self.unlink(id);
        let node = self.slots[id].take().expect("linked slot is occupied");
        self.index.remove(&node.key);
        self.free.push(id);
        node
    }

    fn get(&mut self, key: &str, now: Instant) -> Lookup {
        let Some(&id) = self.index.get(key) else {
            return Lookup::Miss;
        };
        if self.node(id).expires_at <= now {
            self.remove_slot(id);
            return Lookup::Expired;
        }
        self.unlink(id);
        self.push_front(id);
        let node = self.node(id);
        Lookup::Hit {
            value: node.value.clone(),
            age: now.saturating_duration_since(node.created_at),
        }
    }

    /// Insert or refresh `key` at the MRU position; returns the evicted key
    fn insert(
        &mut self,
        key: String,
        value: Message,
        now: Instant,
        ttl: Duration,
        max_size: usize,
    ) -> Option<String> {
        if let Some(&id) = self.index.get(&key) {
            let node = self.node_mut(id);
            node.value = value;
            node.created_at = now;
            node.expires_at = now + ttl;
            self.unlink(id);
            self.push_front(id);
            return None;
        }

        let evicted = if self.len() >= max_size {
            self.tail.map(|lru| self.remove_slot(lru).key)
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            created_at: now,
            expires_at: now + ttl,
            prev: None,
            next: None,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, id);
        self.push_front(id);
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&id) => {
                self.remove_slot(id);
                true
            }
            None => false,
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<SlotId> = self
            .index
            .values()
            .copied()
            .filter(|&id| self.node(id).expires_at <= now)
            .collect();
        for &id in &expired {
            self.remove_slot(id);
        }
        expired.len()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }

    /// Keys from most to least recently used
    #[cfg(test)]
    fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let node = self.node(id);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }
}

#[derive(Debug, Default)]
struct CacheState {
    store: LruStore,
    metrics: CacheMetrics,
}

/// Caching decorator with LRU eviction and TTL expiry
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{CacheConfig, ResponseCache};
/// use bulwark_core_processor::{CancellationToken, FnProcessor, Message, Processor, ProcessorError};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), ProcessorError> {
/// let backend = Arc::new(FnProcessor::new("backend", |m: Message| async move {
///     Ok::<_, ProcessorError>(Message::assistant(m.content.to_uppercase()))
/// }));
/// let cache = ResponseCache::new(
///     backend,
///     CacheConfig {
///         max_size: 500,
///         default_ttl: Duration::from_secs(60),
///         ..Default::default()
///     },
/// );
///
/// let cancel = CancellationToken::new();
/// cache.process(Message::user("hi"), &cancel).await?; // miss
/// cache.process(Message::user("hi"), &cancel).await?; // hit
/// assert_eq!(cache.metrics().hits, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<dyn Processor>,
    config: Arc<CacheConfig>,
    state: Arc<Mutex<CacheState>>,
}

impl ResponseCache {
    pub fn new(inner: Arc<dyn Processor>, config: CacheConfig) -> Self {
        Self {
            inner,
            config: Arc::new(config.normalized()),
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cache key this decorator would use for `message`
    pub fn key_for(&self, message: &Message) -> String {
        match &self.config.key_fn {
            Some(key_fn) => key_fn(message),
            None => default_key(message),
        }
    }

    /// Remove a single entry; returns whether it was resident
    pub fn invalidate(&self, key: &str) -> bool {
        self.state().store.remove(key)
    }

    /// Remove every entry
    pub fn invalidate_all(&self) {
        self.state().store.clear();
    }

    /// Remove all expired entries now; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state();
        let purged = state.store.purge_expired(Instant::now());
        state.metrics.expirations += purged as u64;
        purged
    }

    pub fn len(&self) -> usize {
        self.state().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.state();
        CacheMetrics {
            size: state.store.len(),
            ..state.metrics.clone()
        }
    }

    #[cfg(test)]
    fn resident_keys(&self) -> Vec<String> {
        self.state().store.keys()
    }
}

#[async_trait]
impl Processor for ResponseCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.inner.capabilities()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        let key = self.key_for(&request);

        {
            let mut state = self.state();
            let now = Instant::now();
            state.metrics.requests += 1;

            if state.metrics.requests % self.config.sweep_interval == 0 {
                let purged = state.store.purge_expired(now);
                state.metrics.expirations += purged as u64;
                if purged > 0 {
                    debug!(processor = self.inner.name(), purged, "Swept expired cache entries");
                }
            }

            match state.store.get(&key, now) {
                Lookup::Hit { value, age } => {
                    state.metrics.hits += 1;
                    debug!(
                        processor = self.inner.name(),
                        key = %key,
                        age_ms = age.as_millis() as u64,
                        "Cache hit"
                    );
                    return Ok(value);
                }
                Lookup::Expired => {
                    state.metrics.expirations += 1;
                    state.metrics.misses += 1;
                }
                Lookup::Miss => state.metrics.misses += 1,
            }
        }

        debug!(processor = self.inner.name(), key = %key, "Cache miss");
        let response = self.inner.process(request, cancel).await?;

        let mut state = self.state();
        let evicted = state.store.insert(
            key,
            response.clone(),
            Instant::now(),
            self.config.default_ttl,
            self.config.max_size,
        );
        state.metrics.inserts += 1;
        if let Some(evicted) = evicted {
            state.metrics.evictions += 1;
            debug!(processor = self.inner.name(), key = %evicted, "Evicted least recently used entry");
        }

        Ok(response)
    }
}
