//! Coalescing async loading cache
//!
//! Concurrent requesters for the same key attach to a single in-flight
//! load; the loader runs once. Removal (expiry or explicit invalidation)
//! does not cancel waiters already attached to the pending load, but no
//! new waiters attach to a removed entry. Failed loads are evicted so the
//! next requester retries.

use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;

type SharedLoad<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// A keyed cache whose values are produced by coalesced async loaders
pub struct LoadingCache<K, V, E>
where
    K: Eq + Hash,
{
    entries: DashMap<K, SharedLoad<V, E>>,
}

impl<K, V, E> LoadingCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Get the cached value, or start `loader` if no load is underway.
    pub async fn get_or_load<F, Fut>(&self, key: &K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let shared = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| loader().boxed().shared())
            .clone();
        // The map guard is dropped before awaiting so other keys (and
        // other waiters of this key) proceed freely.
        let result = shared.clone().await;
        if result.is_err() {
            self.entries.remove_if(key, |_, entry| entry.ptr_eq(&shared));
        }
        result
    }

    /// Remove the entry. Pending waiters still observe the value they were
    /// waiting for.
    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V, E> Default for LoadingCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
