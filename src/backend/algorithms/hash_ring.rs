//! Consistent-hash load balancing.
//!
//! Serves ip_hash, url_hash and content_based. Each backend is placed on
//! a ring of 64-bit points at `virtual_nodes` positions (first eight bytes
//! of SHA-256 of `url#n`). A key goes to the first point at or after its
//! own hash, wrapping around. Removing a backend only moves the keys that
//! landed on its points.

use super::{LoadBalancer, RoundRobin};
use crate::backend::RequestContext;
use crate::registry::BackendRef;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Request attribute hashed onto the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashKey {
    ClientIp,
    Path,
    Header(String),
}

impl HashKey {
    fn extract(&self, ctx: &RequestContext) -> Option<String> {
        match self {
            HashKey::ClientIp => ctx.client_ip().map(|ip| ip.to_string()),
            HashKey::Path => ctx.path().map(str::to_string),
            HashKey::Header(name) => ctx.header(name).map(str::to_string),
        }
    }
}

/// Ring built for one exact pool membership.
struct Ring {
    members: Vec<String>,
    points: BTreeMap<u64, usize>,
}

impl Ring {
    fn build(pool: &[BackendRef], virtual_nodes: u32) -> Self {
        let mut points = BTreeMap::new();
        for (idx, entry) in pool.iter().enumerate() {
            for n in 0..virtual_nodes {
                points.insert(hash_key(&format!("{}#{}", entry.url(), n)), idx);
            }
        }
        Self {
            members: pool.iter().map(|e| e.url().to_string()).collect(),
            points,
        }
    }

    fn matches(&self, pool: &[BackendRef]) -> bool {
        self.members.len() == pool.len()
            && self.members.iter().zip(pool).all(|(url, e)| url == e.url())
    }

    fn locate(&self, key_hash: u64) -> Option<usize> {
        self.points
            .range(key_hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, idx)| *idx)
    }
}

/// Consistent-hash load balancer.
///
/// The ring is cached and rebuilt only when the healthy pool changes.
/// Requests without a key fall back to round robin.
pub struct HashRing {
    key: HashKey,
    virtual_nodes: u32,
    ring: Mutex<Option<Arc<Ring>>>,
    fallback: RoundRobin,
    name: &'static str,
}

impl HashRing {
    pub fn by_client_ip(virtual_nodes: u32) -> Self {
        Self::new(HashKey::ClientIp, virtual_nodes, "ip_hash")
    }

    pub fn by_path(virtual_nodes: u32) -> Self {
        Self::new(HashKey::Path, virtual_nodes, "url_hash")
    }

    pub fn by_header(header: &str, virtual_nodes: u32) -> Self {
        Self::new(
            HashKey::Header(header.to_ascii_lowercase()),
            virtual_nodes,
            "content_based",
        )
    }

    fn new(key: HashKey, virtual_nodes: u32, name: &'static str) -> Self {
        Self {
            key,
            virtual_nodes: virtual_nodes.max(1),
            ring: Mutex::new(None),
            fallback: RoundRobin::new(),
            name,
        }
    }

    fn ring_for(&self, pool: &[BackendRef]) -> Arc<Ring> {
        let mut cached = self.ring.lock();
        if let Some(ring) = cached.as_ref() {
            if ring.matches(pool) {
                return Arc::clone(ring);
            }
        }
        let ring = Arc::new(Ring::build(pool, self.virtual_nodes));
        *cached = Some(Arc::clone(&ring));
        ring
    }
}

impl LoadBalancer for HashRing {
    fn select(&self, pool: &[BackendRef], ctx: &RequestContext) -> Option<usize> {
        if pool.is_empty() {
            return None;
        }
        let Some(key) = self.key.extract(ctx) else {
            return self.fallback.next_index(pool.len());
        };

        self.ring_for(pool).locate(hash_key(&key))
    }

    fn reset(&self) {
        *self.ring.lock() = None;
        self.fallback.reset();
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// First eight bytes of SHA-256, big-endian.
fn hash_key(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::test_support::pool;
    use std::net::IpAddr;

    fn client(ip: &str) -> RequestContext {
        RequestContext::new().with_client_ip(ip.parse::<IpAddr>().unwrap())
    }

    #[test]
    fn test_ip_hash_consistency() {
        let lb = HashRing::by_client_ip(160);
        let servers = pool(&[(8001, 1), (8002, 1), (8003, 1)]);

        let first = lb.select(&servers, &client("192.168.1.100")).unwrap();
        for _ in 0..10 {
            assert_eq!(lb.select(&servers, &client("192.168.1.100")), Some(first));
        }
    }

    #[test]
    fn test_keys_spread_across_backends() {
        let lb = HashRing::by_client_ip(160);
        let servers = pool(&[(8001, 1), (8002, 1), (8003, 1)]);

        let mut seen = [false; 3];
        for i in 0..200 {
            let idx = lb.select(&servers, &client(&format!("10.0.{}.{}", i / 250, i % 250))).unwrap();
            seen[idx] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_removal_only_moves_keys_of_removed_backend() {
        let lb = HashRing::by_path(160);
        let servers = pool(&[(8001, 1), (8002, 1), (8003, 1)]);
        let reduced: Vec<BackendRef> = vec![servers[0].clone(), servers[2].clone()];

        for i in 0..300 {
            let ctx = RequestContext::new().with_path(format!("/item/{i}"));
            let before = servers[lb.select(&servers, &ctx).unwrap()].url().to_string();
            let after = reduced[lb.select(&reduced, &ctx).unwrap()].url().to_string();
            if before != servers[1].url() {
                assert_eq!(before, after, "key /item/{i} moved needlessly");
            }
        }
    }

    #[test]
    fn test_header_key() {
        let lb = HashRing::by_header("X-Tenant", 160);
        let servers = pool(&[(8001, 1), (8002, 1)]);
        let ctx = RequestContext::new().with_header("x-tenant", "acme");

        let first = lb.select(&servers, &ctx).unwrap();
        assert_eq!(lb.select(&servers, &ctx), Some(first));
    }

    #[test]
    fn test_missing_key_falls_back_to_round_robin() {
        let lb = HashRing::by_path(160);
        let servers = pool(&[(8001, 1), (8002, 1)]);
        let ctx = RequestContext::new();

        assert_eq!(lb.select(&servers, &ctx), Some(0));
        assert_eq!(lb.select(&servers, &ctx), Some(1));
    }

    #[test]
    fn test_hash_key_is_stable() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }
}
