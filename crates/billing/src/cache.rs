//! Read-through entitlement cache
//!
//! Entries live at most `ttl`, counted from when their load started.
//! `invalidate` is called by `SubscriptionService` after every committed write
//! and stamps the user, so a load that started before the write cannot
//! re-insert the value it read. Stamps and entries older than `ttl` can no
//! longer affect a lookup and are swept at most once per `ttl`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::entitlement::EntitlementSet;
use crate::error::BillingResult;
use crate::store::SubscriptionRecord;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntitlement {
    pub record: SubscriptionRecord,
    pub entitlement: EntitlementSet,
}

struct Entry {
    value: CachedEntitlement,
    cached_at: Instant,
}

struct CacheState {
    entries: HashMap<Uuid, Entry>,
    invalidated: HashMap<Uuid, Instant>,
    last_sweep: Instant,
}

impl CacheState {
    fn sweep(&mut self, ttl: Duration) {
        if self.last_sweep.elapsed() < ttl {
            return;
        }
        self.entries.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        self.invalidated.retain(|_, at| at.elapsed() < ttl);
        self.last_sweep = Instant::now();
    }
}

pub struct EntitlementCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl EntitlementCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                invalidated: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Fresh entry for `user_id`, if any
    pub fn get(&self, user_id: Uuid) -> Option<CachedEntitlement> {
        let state = self.state.read().ok()?;
        state
            .entries
            .get(&user_id)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Return the cached value or run `load` and cache its result
    pub async fn get_or_load<F, Fut>(&self, user_id: Uuid, load: F) -> BillingResult<CachedEntitlement>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<CachedEntitlement>>,
    {
        if let Some(hit) = self.get(user_id) {
            return Ok(hit);
        }

        let started = Instant::now();
        let value = load().await?;
        self.insert_if_current(user_id, started, value.clone());
        Ok(value)
    }

    /// Drop the entry and fence off in-flight loads
    pub fn invalidate(&self, user_id: Uuid) {
        match self.state.write() {
            Ok(mut state) => {
                state.entries.remove(&user_id);
                state.invalidated.insert(user_id, Instant::now());
                state.sweep(self.ttl);
            }
            Err(_) => tracing::error!(user_id = %user_id, "Entitlement cache lock poisoned"),
        }
        tracing::debug!(user_id = %user_id, "Invalidated entitlement cache");
    }

    fn insert_if_current(&self, user_id: Uuid, started: Instant, value: CachedEntitlement) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.sweep(self.ttl);
        if state.invalidated.get(&user_id).is_some_and(|at| *at >= started) {
            return;
        }
        state.entries.insert(
            user_id,
            Entry {
                value,
                cached_at: started,
            },
        );
    }
}

impl Default for EntitlementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
