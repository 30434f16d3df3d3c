//! Static endpoint classification.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use fiscalgate_common::types::duration_ms;
use fiscalgate_common::{HttpMethod, Result};
use fiscalgate_storage::GlobPattern;

use crate::key::cache_key;
use crate::quality::DEFAULT_QUALITY_TTL;
use crate::strategy::CacheStrategy;

/// Caching class of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Login, token and credential endpoints. Never cached.
    Auth,
    /// Non-idempotent call. Never cached.
    Mutation,
    /// Slow-changing resources (merchants, suppliers, devices).
    Reference,
    /// Frequently mutated lists (receipts). Always fetched from the network.
    Volatile,
    /// Detail resources that do not change once created.
    ImmutableDetail,
    /// Anything else read-only.
    Default,
}

/// Default caching behaviour for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub class: EndpointClass,
    /// Strategy used when network quality gives no reason to deviate.
    pub strategy: CacheStrategy,
    /// TTL of written entries; `None` means nothing is written.
    pub ttl: Option<Duration>,
    /// Whether stale entries may be served while refreshing in the background.
    pub background_refresh: bool,
}

impl CachePolicy {
    /// Whether responses may be written to the cache at all.
    pub fn is_cacheable(&self) -> bool {
        self.ttl.is_some()
    }
}

/// TTLs and timings of the cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a network quality assessment is reused.
    #[serde(with = "duration_ms")]
    pub quality_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub reference_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub detail_ttl: Duration,
    /// TTL of the offline fallback copy of volatile lists.
    #[serde(with = "duration_ms")]
    pub volatile_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            quality_ttl: DEFAULT_QUALITY_TTL,
            reference_ttl: Duration::from_secs(60 * 60),
            detail_ttl: Duration::from_secs(5 * 60),
            volatile_ttl: Duration::from_secs(5 * 60),
            default_ttl: Duration::from_secs(60),
        }
    }
}

/// Ordered pattern table; the first match wins.
const ENDPOINT_TABLE: &[(&str, EndpointClass)] = &[
    ("*/login*", EndpointClass::Auth),
    ("*/logout*", EndpointClass::Auth),
    ("*/token*", EndpointClass::Auth),
    ("*/auth/*", EndpointClass::Auth),
    ("*/password*", EndpointClass::Auth),
    ("*/me", EndpointClass::Auth),
    ("/mf1/receipts", EndpointClass::Volatile),
    ("/mf1/receipts?*", EndpointClass::Volatile),
    ("/mf1/point-of-sales/*/receipts*", EndpointClass::Volatile),
    ("/mf1/receipts/*", EndpointClass::ImmutableDetail),
    ("/mf*/merchants*", EndpointClass::Reference),
    ("/mf*/suppliers*", EndpointClass::Reference),
    ("/mf*/point-of-sales*", EndpointClass::Reference),
    ("/mf*/cashiers*", EndpointClass::Reference),
];

/// Maps request URLs to cache policies.
pub struct EndpointClassifier {
    rules: Vec<(GlobPattern, EndpointClass)>,
    config: CacheConfig,
}

impl EndpointClassifier {
    /// Create a classifier over the built-in endpoint table.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let rules = ENDPOINT_TABLE
            .iter()
            .map(|(pattern, class)| Ok((GlobPattern::new(pattern)?, *class)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, config })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Endpoint class of a call.
    pub fn class_of(&self, url: &str, method: HttpMethod) -> EndpointClass {
        let key = cache_key(url);
        let table_class = self
            .rules
            .iter()
            .find(|(pattern, _)| pattern.matches(&key))
            .map(|(_, class)| *class);

        match table_class {
            Some(EndpointClass::Auth) => EndpointClass::Auth,
            _ if method.is_mutating() => EndpointClass::Mutation,
            Some(class) => class,
            None => EndpointClass::Default,
        }
    }

    /// Default caching policy of a call.
    pub fn classify(&self, url: &str, method: HttpMethod) -> CachePolicy {
        let class = self.class_of(url, method);
        let c = &self.config;

        match class {
            EndpointClass::Auth | EndpointClass::Mutation => CachePolicy {
                class,
                strategy: CacheStrategy::NetworkOnly,
                ttl: None,
                background_refresh: false,
            },
            EndpointClass::Volatile => CachePolicy {
                class,
                strategy: CacheStrategy::NetworkFirst,
                ttl: Some(c.volatile_ttl),
                background_refresh: false,
            },
            EndpointClass::Reference => CachePolicy {
                class,
                strategy: CacheStrategy::StaleWhileRevalidate,
                ttl: Some(c.reference_ttl),
                background_refresh: true,
            },
            EndpointClass::ImmutableDetail => CachePolicy {
                class,
                strategy: CacheStrategy::StaleWhileRevalidate,
                ttl: Some(c.detail_ttl),
                background_refresh: true,
            },
            EndpointClass::Default => CachePolicy {
                class,
                strategy: CacheStrategy::NetworkFirst,
                ttl: Some(c.default_ttl),
                background_refresh: false,
            },
        }
    }
}
