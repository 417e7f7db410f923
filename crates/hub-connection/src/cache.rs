//! TTL cache in front of the state queries.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use hubwire_protocol::StateRecord;

use crate::config::CachePolicy;

/// Key/value store whose entries are served only while younger than the TTL.
pub(crate) struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, (V, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a clone of the value if it is still fresh. Expired entries are
    /// dropped on the way.
    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        let fresh = match entries.get(key) {
            Some((value, cached_at)) if cached_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => None,
            None => return None,
        };
        if fresh.is_none() {
            entries.remove(key);
        }
        fresh
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        self.lock().insert(key, (value, Instant::now()));
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Drops every expired entry.
    pub(crate) fn purge_expired(&self) {
        let ttl = self.ttl;
        self.lock().retain(|_, (_, cached_at)| cached_at.elapsed() < ttl);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    AllStates,
    Entity(String),
}

#[derive(Clone)]
enum Cached {
    All(Vec<StateRecord>),
    One(StateRecord),
}

/// Outcome of a single-entity lookup.
pub(crate) enum Lookup {
    Found(StateRecord),
    /// A fresh full snapshot exists and does not contain the entity.
    Missing,
}

/// Wraps the two state queries. With caching off every call goes straight
/// to `fetch`.
pub(crate) struct StateCache {
    cache: Option<TtlCache<CacheKey, Cached>>,
    /// Bumped by [`clear`](Self::clear) so a fetch that started before it
    /// cannot repopulate the cache afterwards.
    epoch: AtomicU64,
}

impl StateCache {
    pub(crate) fn new(policy: Option<&CachePolicy>) -> Self {
        Self {
            cache: policy.map(|p| TtlCache::new(p.ttl())),
            epoch: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// All entity states, from cache when fresh.
    pub(crate) async fn all_states<F, Fut, E>(&self, fetch: F) -> Result<Vec<StateRecord>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<StateRecord>, E>>,
    {
        let Some(cache) = &self.cache else {
            return fetch().await;
        };
        if let Some(Cached::All(states)) = cache.get(&CacheKey::AllStates) {
            return Ok(states);
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let states = fetch().await?;
        if self.epoch.load(Ordering::Acquire) == epoch {
            cache.insert(CacheKey::AllStates, Cached::All(states.clone()));
        }
        Ok(states)
    }

    /// One entity. Served from its own entry, then from a fresh full
    /// snapshot, and otherwise fetched through `fetch` (which returns all
    /// states); both entries are refreshed from the fetch.
    pub(crate) async fn state<F, Fut, E>(&self, entity_id: &str, fetch: F) -> Result<Lookup, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<StateRecord>, E>>,
    {
        let Some(cache) = &self.cache else {
            let states = fetch().await?;
            return Ok(find(states, entity_id));
        };

        let key = CacheKey::Entity(entity_id.to_string());
        if let Some(Cached::One(state)) = cache.get(&key) {
            return Ok(Lookup::Found(state));
        }
        if let Some(Cached::All(states)) = cache.get(&CacheKey::AllStates) {
            let found = find(states, entity_id);
            if let Lookup::Found(state) = &found {
                cache.insert(key, Cached::One(state.clone()));
            }
            return Ok(found);
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let states = fetch().await?;
        let found = find(states.clone(), entity_id);
        if self.epoch.load(Ordering::Acquire) == epoch {
            cache.insert(CacheKey::AllStates, Cached::All(states));
            if let Lookup::Found(state) = &found {
                cache.insert(key, Cached::One(state.clone()));
            }
        }
        Ok(found)
    }

    /// Forgets everything, including what in-flight fetches bring back.
    pub(crate) fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    pub(crate) fn purge_expired(&self) {
        if let Some(cache) = &self.cache {
            cache.purge_expired();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }
}

fn find(states: Vec<StateRecord>, entity_id: &str) -> Lookup {
    states
        .into_iter()
        .find(|s| s.entity_id == entity_id)
        .map_or(Lookup::Missing, Lookup::Found)
}
