//! Session-affinity load balancing.
//!
//! Serves both sticky_round_robin (keyed by the session key) and
//! cookie_based (keyed by a cookie value).

use super::{LoadBalancer, RoundRobin};
use crate::backend::RequestContext;
use crate::registry::BackendRef;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Inserts between sweeps of expired mappings.
const PRUNE_EVERY: usize = 1024;

/// Where the affinity key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKey {
    Session,
    Cookie(String),
}

impl SessionKey {
    fn extract<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        match self {
            SessionKey::Session => ctx.session_key(),
            SessionKey::Cookie(name) => ctx.cookie(name),
        }
        .filter(|key| !key.is_empty())
    }
}

struct Affinity {
    url: String,
    expires_at: Instant,
}

/// Sticky load balancer.
///
/// A key mapped to a backend still in the healthy pool keeps going there
/// and has its expiry pushed out. Anything else is placed by round robin
/// and the new mapping recorded. Requests without a key are plain round
/// robin and record nothing.
pub struct Sticky {
    key: SessionKey,
    ttl: Duration,
    sessions: DashMap<String, Affinity>,
    fallback: RoundRobin,
    inserts: AtomicUsize,
    name: &'static str,
}

impl Sticky {
    /// sticky_round_robin keyed by the request's session key.
    pub fn by_session(ttl: Duration) -> Self {
        Self::new(SessionKey::Session, ttl, "sticky_round_robin")
    }

    /// cookie_based keyed by the named cookie.
    pub fn by_cookie(cookie_name: impl Into<String>, ttl: Duration) -> Self {
        Self::new(SessionKey::Cookie(cookie_name.into()), ttl, "cookie_based")
    }

    fn new(key: SessionKey, ttl: Duration, name: &'static str) -> Self {
        Self {
            key,
            ttl,
            sessions: DashMap::new(),
            fallback: RoundRobin::new(),
            inserts: AtomicUsize::new(0),
            name,
        }
    }

    /// Number of live mappings, expired ones included until pruned.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn prune(&self, now: Instant) {
        self.sessions.retain(|_, affinity| affinity.expires_at > now);
    }
}

impl LoadBalancer for Sticky {
    fn select(&self, pool: &[BackendRef], ctx: &RequestContext) -> Option<usize> {
        let Some(key) = self.key.extract(ctx) else {
            return self.fallback.next_index(pool.len());
        };
        let now = Instant::now();

        if let Some(mut affinity) = self.sessions.get_mut(key) {
            if affinity.expires_at > now {
                if let Some(idx) = pool.iter().position(|e| e.url() == affinity.url) {
                    affinity.expires_at = now + self.ttl;
                    return Some(idx);
                }
            }
        }

        let idx = self.fallback.next_index(pool.len())?;
        self.sessions.insert(
            key.to_string(),
            Affinity {
                url: pool[idx].url().to_string(),
                expires_at: now + self.ttl,
            },
        );

        if self.inserts.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }
        Some(idx)
    }

    fn forget(&self, url: &str) {
        self.sessions.retain(|_, affinity| affinity.url != url);
    }

    fn reset(&self) {
        self.sessions.clear();
        self.fallback.reset();
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
