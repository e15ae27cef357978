//! Short-lived memoization of node queries
//!
//! A [`ResultCache`] holds at most one value per call site. Call sites are
//! identified by a static key chosen by the caller, never by the arguments of
//! the query: two calls with the same key share one slot.
//!
//! The cache is plain mutable state owned by a single node and offers no
//! synchronization of its own.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

struct CachedValue {
    value: Box<dyn Any + Send + Sync>,
    cached_at: Instant,
}

impl CachedValue {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() <= ttl
    }
}

/// TTL cache keyed by call site
#[derive(Default)]
pub struct ResultCache {
    slots: HashMap<&'static str, CachedValue>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value cached under `key` if it is younger than `ttl`.
    ///
    /// A slot holding a value of another type counts as a miss.
    pub fn lookup<T>(&self, key: &'static str, ttl: Duration) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.slots
            .get(key)
            .filter(|cached| cached.is_fresh(ttl))
            .and_then(|cached| cached.value.downcast_ref::<T>())
            .cloned()
    }

    /// Store `value` under `key`, stamped with the current time
    pub fn store<T>(&mut self, key: &'static str, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.slots.insert(
            key,
            CachedValue {
                value: Box::new(value),
                cached_at: Instant::now(),
            },
        );
    }

    /// Return the cached value, or run `producer` and cache its result.
    ///
    /// `producer` runs when `bypass` is set, when nothing is cached under
    /// `key`, or when the cached value is older than `ttl`. Failed productions
    /// are not cached and leave the previous value in place.
    pub async fn cache<T, E, F, Fut>(
        &mut self,
        key: &'static str,
        ttl: Duration,
        bypass: bool,
        producer: F,
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !bypass {
            if let Some(value) = self.lookup::<T>(key, ttl) {
                tracing::trace!(key, "cache hit");
                return Ok(value);
            }
        }

        let value = producer().await?;
        self.store(key, value.clone());
        Ok(value)
    }

    /// Drop the value cached under `key`
    pub fn invalidate(&mut self, key: &'static str) {
        self.slots.remove(key);
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("keys", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}
