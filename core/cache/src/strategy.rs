//! Cache strategy selection.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::policy::{CachePolicy, EndpointClass};
use crate::quality::NetworkQuality;

/// How one read is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Fetch, write through; on failure fall back to any cached entry.
    NetworkFirst,
    /// Serve any cached entry; otherwise fetch and cache.
    CacheFirst,
    /// Fetch; never touch the cache.
    NetworkOnly,
    /// Serve the cached entry or fail.
    CacheOnly,
    /// Serve any cached entry and refresh it in the background.
    StaleWhileRevalidate,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheStrategy::NetworkFirst => "network-first",
            CacheStrategy::CacheFirst => "cache-first",
            CacheStrategy::NetworkOnly => "network-only",
            CacheStrategy::CacheOnly => "cache-only",
            CacheStrategy::StaleWhileRevalidate => "stale-while-revalidate",
        };
        f.write_str(name)
    }
}

/// What the cache holds for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Miss,
    /// Present and within its TTL.
    Fresh,
    /// Present but past its TTL.
    Stale,
}

impl CacheState {
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheState::Miss)
    }
}

/// Pick the strategy for a read.
///
/// - Uncacheable endpoints are always network-only.
/// - Offline: cache-only, which fails when nothing is cached.
/// - Volatile endpoints and fast links: network-first.
/// - Slow or unreliable links: cache when fresh, refreshing in the
///   background where the policy allows it.
/// - Otherwise the policy decides, with fresh entries served from cache.
pub fn select(policy: &CachePolicy, state: CacheState, quality: &NetworkQuality) -> CacheStrategy {
    if !policy.is_cacheable() {
        return CacheStrategy::NetworkOnly;
    }
    if !quality.is_online {
        return CacheStrategy::CacheOnly;
    }
    if policy.class == EndpointClass::Volatile || quality.is_fast() {
        return CacheStrategy::NetworkFirst;
    }

    if quality.is_poor() {
        return match state {
            CacheState::Fresh if policy.background_refresh => CacheStrategy::StaleWhileRevalidate,
            CacheState::Fresh => CacheStrategy::CacheFirst,
            CacheState::Stale | CacheState::Miss => CacheStrategy::NetworkFirst,
        };
    }

    match (state, policy.strategy) {
        (CacheState::Fresh, _) => CacheStrategy::CacheFirst,
        (CacheState::Stale, CacheStrategy::StaleWhileRevalidate) => {
            CacheStrategy::StaleWhileRevalidate
        }
        _ => CacheStrategy::NetworkFirst,
    }
}
