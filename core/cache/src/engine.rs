//! Cache strategy execution.
//!
//! The engine never fails a call because of the cache: read and write
//! errors are logged and treated as a miss or a skipped write.

use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fiscalgate_common::{system_clock, Error, HttpMethod, Result, SharedClock};
use fiscalgate_storage::{CacheAdapter, CachedItem};

use crate::invalidation::patterns_for_mutation;
use crate::key::cache_key;
use crate::policy::{CachePolicy, EndpointClassifier};
use crate::quality::QualityAssessor;
use crate::strategy::{select, CacheState, CacheStrategy};

const EVENT_CAPACITY: usize = 256;

/// Where the returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedFrom {
    Network,
    Cache,
}

/// Data returned by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOutcome {
    pub data: serde_json::Value,
    pub strategy: CacheStrategy,
    pub served_from: ServedFrom,
}

/// Cache activity notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A read was answered from the cache.
    Hit { key: String, strategy: CacheStrategy },
    /// The network failed and a cached entry was served instead.
    FallbackServed { key: String },
    /// A background refresh stored new data.
    Refreshed { key: String },
    /// A background refresh failed; the cached entry is unchanged.
    RefreshFailed { key: String, error: String },
    /// Keys matching a pattern were removed after a mutation.
    Invalidated { pattern: String, removed: usize },
}

/// Removes its key from the in-flight set when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    /// Claim `key`, or `None` if a refresh for it is already running.
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut keys = set.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Serves reads through the response cache according to a strategy.
pub struct CacheStrategyEngine {
    cache: Arc<dyn CacheAdapter>,
    classifier: EndpointClassifier,
    assessor: QualityAssessor,
    clock: SharedClock,
    in_flight: Arc<Mutex<HashSet<String>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl CacheStrategyEngine {
    pub fn new(
        cache: Arc<dyn CacheAdapter>,
        classifier: EndpointClassifier,
        assessor: QualityAssessor,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            cache,
            classifier,
            assessor,
            clock: system_clock(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            events,
        }
    }

    /// Use a different clock for expiry checks.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn classifier(&self) -> &EndpointClassifier {
        &self.classifier
    }

    pub fn assessor(&self) -> &QualityAssessor {
        &self.assessor
    }

    pub fn cache(&self) -> &Arc<dyn CacheAdapter> {
        &self.cache
    }

    /// Default policy of a call.
    pub fn classify(&self, url: &str, method: HttpMethod) -> CachePolicy {
        self.classifier.classify(url, method)
    }

    /// Number of background refreshes currently running.
    pub fn refreshes_in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Classify, select and run a read in one step.
    ///
    /// # Errors
    /// - `Error::OfflineNoCache` when offline with nothing cached
    /// - The fetch error when the network fails and nothing is cached
    pub async fn fetch<F, Fut>(
        &self,
        url: &str,
        method: HttpMethod,
        fetch: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let key = cache_key(url);
        let policy = self.classifier.classify(&key, method);
        let cached = if policy.is_cacheable() {
            self.lookup(&key).await
        } else {
            None
        };

        let state = self.state_of(cached.as_ref());
        let quality = self.assessor.assess();
        let strategy = select(&policy, state, &quality);
        debug!(key = %key, %strategy, ?state, class = ?policy.class, "Selected cache strategy");

        self.execute(strategy, &key, policy.ttl, cached, fetch).await
    }

    /// Run an explicit strategy for `key`.
    ///
    /// Entries are written with `ttl`.
    pub async fn run<F, Fut>(
        &self,
        strategy: CacheStrategy,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let cached = match strategy {
            CacheStrategy::NetworkOnly => None,
            _ => self.lookup(key).await,
        };
        self.execute(strategy, key, ttl, cached, fetch).await
    }

    async fn execute<F, Fut>(
        &self,
        strategy: CacheStrategy,
        key: &str,
        ttl: Option<Duration>,
        cached: Option<CachedItem>,
        fetch: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        match strategy {
            CacheStrategy::NetworkOnly => {
                let data = fetch().await?;
                Ok(self.outcome(data, strategy, ServedFrom::Network))
            }
            CacheStrategy::CacheOnly => match cached {
                Some(item) => Ok(self.hit(key, item, strategy)),
                None => Err(Error::OfflineNoCache(key.to_string())),
            },
            CacheStrategy::CacheFirst => match cached {
                Some(item) => Ok(self.hit(key, item, strategy)),
                None => {
                    let data = fetch().await?;
                    self.write(key, &data, ttl).await;
                    Ok(self.outcome(data, strategy, ServedFrom::Network))
                }
            },
            CacheStrategy::StaleWhileRevalidate => match cached {
                Some(item) => {
                    self.spawn_refresh(key, ttl, fetch);
                    Ok(self.hit(key, item, strategy))
                }
                None => self.network_first(strategy, key, ttl, None, fetch).await,
            },
            CacheStrategy::NetworkFirst => {
                self.network_first(strategy, key, ttl, cached, fetch).await
            }
        }
    }

    async fn network_first<F, Fut>(
        &self,
        strategy: CacheStrategy,
        key: &str,
        ttl: Option<Duration>,
        cached: Option<CachedItem>,
        fetch: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        match fetch().await {
            Ok(data) => {
                self.write(key, &data, ttl).await;
                Ok(self.outcome(data, strategy, ServedFrom::Network))
            }
            Err(e) => match cached {
                Some(item) => {
                    warn!(key = %key, "Network failed ({}), serving cached data", e);
                    self.emit(CacheEvent::FallbackServed {
                        key: key.to_string(),
                    });
                    Ok(self.outcome(item.data, strategy, ServedFrom::Cache))
                }
                None => Err(e),
            },
        }
    }

    /// Start a background refresh unless one is already running for `key`.
    ///
    /// Returns whether a refresh was started.
    fn spawn_refresh<F, Fut>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, key) else {
            debug!(key = %key, "Refresh already in flight");
            return false;
        };

        let cache = self.cache.clone();
        let events = self.events.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            match fetch().await {
                Ok(data) => match cache.set(&key, data, ttl).await {
                    Ok(()) => {
                        debug!(key = %key, "Background refresh stored");
                        let _ = events.send(CacheEvent::Refreshed { key });
                    }
                    Err(e) => warn!(key = %key, "Failed to store refreshed data: {}", e),
                },
                Err(e) => {
                    warn!(key = %key, "Background refresh failed: {}", e);
                    let _ = events.send(CacheEvent::RefreshFailed {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        });
        true
    }

    /// Invalidate every key made stale by a successful mutating call.
    ///
    /// Failures are logged and skipped.
    ///
    /// # Returns
    /// Number of removed entries.
    pub async fn invalidate_after_mutation(&self, url: &str, method: HttpMethod) -> usize {
        let mut removed = 0;
        for pattern in patterns_for_mutation(url, method) {
            match self.cache.invalidate(&pattern).await {
                Ok(count) => {
                    if count > 0 {
                        info!(pattern = %pattern, count, "Invalidated cache entries");
                    }
                    removed += count;
                    self.emit(CacheEvent::Invalidated {
                        pattern,
                        removed: count,
                    });
                }
                Err(e) => warn!(pattern = %pattern, "Cache invalidation failed: {}", e),
            }
        }
        removed
    }

    async fn lookup(&self, key: &str) -> Option<CachedItem> {
        match self.cache.get(key).await {
            Ok(item) => item,
            Err(e) => {
                warn!(key = %key, "Cache read failed: {}", e);
                None
            }
        }
    }

    async fn write(&self, key: &str, data: &serde_json::Value, ttl: Option<Duration>) {
        if ttl.is_none() {
            return;
        }
        if let Err(e) = self.cache.set(key, data.clone(), ttl).await {
            warn!(key = %key, "Cache write failed: {}", e);
        }
    }

    fn state_of(&self, item: Option<&CachedItem>) -> CacheState {
        match item {
            None => CacheState::Miss,
            Some(item) if item.is_expired_at(self.clock.now()) => CacheState::Stale,
            Some(_) => CacheState::Fresh,
        }
    }

    fn hit(&self, key: &str, item: CachedItem, strategy: CacheStrategy) -> CacheOutcome {
        self.emit(CacheEvent::Hit {
            key: key.to_string(),
            strategy,
        });
        self.outcome(item.data, strategy, ServedFrom::Cache)
    }

    fn outcome(
        &self,
        data: serde_json::Value,
        strategy: CacheStrategy,
        served_from: ServedFrom,
    ) -> CacheOutcome {
        CacheOutcome {
            data,
            strategy,
            served_from,
        }
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CacheConfig;
    use fiscalgate_common::ManualClock;
    use fiscalgate_storage::{ManualNetworkMonitor, MemoryCacheAdapter, NetworkInfo};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Fixture {
        cache: Arc<MemoryCacheAdapter>,
        monitor: Arc<ManualNetworkMonitor>,
        clock: ManualClock,
        engine: CacheStrategyEngine,
    }

    fn fixture(effective_type: &str, rtt_ms: u64) -> Fixture {
        let clock = ManualClock::starting_now();
        let cache = Arc::new(MemoryCacheAdapter::with_clock(Arc::new(clock.clone())));
        let monitor = Arc::new(ManualNetworkMonitor::new(true));
        monitor.set_network_info(Some(NetworkInfo {
            effective_type: Some(effective_type.to_string()),
            downlink_mbps: None,
            rtt_ms: Some(rtt_ms),
        }));
        let assessor = QualityAssessor::new(monitor.clone()).with_clock(Arc::new(clock.clone()));
        let engine = CacheStrategyEngine::new(
            cache.clone(),
            EndpointClassifier::new(CacheConfig::default()).unwrap(),
            assessor,
        )
        .with_clock(Arc::new(clock.clone()));
        Fixture {
            cache,
            monitor,
            clock,
            engine,
        }
    }

    fn ok(value: serde_json::Value) -> impl FnOnce() -> futures::future::Ready<Result<serde_json::Value>> {
        move || futures::future::ready(Ok(value))
    }

    fn network_down() -> impl FnOnce() -> futures::future::Ready<Result<serde_json::Value>> {
        || futures::future::ready(Err(Error::Network("unreachable".to_string())))
    }

    #[tokio::test]
    async fn test_receipt_list_fast_network_ignores_fresh_cache() {
        let f = fixture("4g", 30);
        f.cache
            .set("/mf1/receipts", json!(["cached"]), Some(Duration::from_secs(300)))
            .await
            .unwrap();

        let outcome = f
            .engine
            .fetch("/mf1/receipts", HttpMethod::Get, ok(json!(["live"])))
            .await
            .unwrap();

        assert_eq!(outcome.strategy, CacheStrategy::NetworkFirst);
        assert_eq!(outcome.served_from, ServedFrom::Network);
        assert_eq!(outcome.data, json!(["live"]));
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache() {
        let f = fixture("4g", 30);
        f.cache
            .set("/mf1/receipts", json!(["cached"]), Some(Duration::from_secs(300)))
            .await
            .unwrap();

        let outcome = f
            .engine
            .fetch("/mf1/receipts", HttpMethod::Get, network_down())
            .await
            .unwrap();

        assert_eq!(outcome.served_from, ServedFrom::Cache);
        assert_eq!(outcome.data, json!(["cached"]));
    }

    #[tokio::test]
    async fn test_network_first_propagates_without_cache() {
        let f = fixture("4g", 30);
        let err = f
            .engine
            .fetch("/mf1/receipts", HttpMethod::Get, network_down())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn test_write_through_uses_policy_ttl() {
        let f = fixture("4g", 30);
        f.engine
            .fetch("/mf1/merchants?page=1", HttpMethod::Get, ok(json!({"id": 1})))
            .await
            .unwrap();

        let item = f.cache.get("/mf1/merchants?page=1").await.unwrap().unwrap();
        assert_eq!(item.ttl, Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_offline_without_cache_fails_explicitly() {
        let f = fixture("4g", 30);
        f.monitor.set_online(false);

        let err = f
            .engine
            .fetch("/mf1/merchants", HttpMethod::Get, ok(json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OfflineNoCache(ref key) if key == "/mf1/merchants"));
    }

    #[tokio::test]
    async fn test_offline_serves_expired_cache() {
        let f = fixture("4g", 30);
        f.cache
            .set("/mf1/receipts", json!(["old"]), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(60));
        f.monitor.set_online(false);

        let outcome = f
            .engine
            .fetch("/mf1/receipts", HttpMethod::Get, ok(json!(["never"])))
            .await
            .unwrap();
        assert_eq!(outcome.strategy, CacheStrategy::CacheOnly);
        assert_eq!(outcome.data, json!(["old"]));
    }

    #[tokio::test]
    async fn test_mutations_bypass_cache() {
        let f = fixture("2g", 900);
        f.cache
            .set("/mf1/receipts", json!("cached"), None)
            .await
            .unwrap();

        let outcome = f
            .engine
            .fetch("/mf1/receipts", HttpMethod::Post, ok(json!({"uuid": "r-1"})))
            .await
            .unwrap();

        assert_eq!(outcome.strategy, CacheStrategy::NetworkOnly);
        assert_eq!(outcome.data, json!({"uuid": "r-1"}));
        assert_eq!(f.cache.get("/mf1/receipts").await.unwrap().unwrap().data, json!("cached"));
    }

    #[tokio::test]
    async fn test_cache_first_fetches_on_miss() {
        let f = fixture("4g", 30);
        let outcome = f
            .engine
            .run(CacheStrategy::CacheFirst, "/k", Some(Duration::from_secs(10)), ok(json!(1)))
            .await
            .unwrap();
        assert_eq!(outcome.served_from, ServedFrom::Network);

        let outcome = f
            .engine
            .run(CacheStrategy::CacheFirst, "/k", Some(Duration::from_secs(10)), ok(json!(2)))
            .await
            .unwrap();
        assert_eq!(outcome.served_from, ServedFrom::Cache);
        assert_eq!(outcome.data, json!(1));
    }

    #[tokio::test]
    async fn test_network_only_and_cache_only_never_cross() {
        let f = fixture("4g", 30);
        f.cache.set("/k", json!("cached"), None).await.unwrap();

        let err = f
            .engine
            .run(CacheStrategy::NetworkOnly, "/k", None, network_down())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let outcome = f
            .engine
            .run(CacheStrategy::CacheOnly, "/k", None, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Ok(json!("network")))
            })
            .await
            .unwrap();
        assert_eq!(outcome.data, json!("cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_single_refresh_per_key() {
        let f = fixture("3g", 200);
        f.cache
            .set("/mf1/merchants", json!("stale"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(5));

        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut events = f.engine.subscribe();

        for _ in 0..5 {
            let gate = gate.clone();
            let calls = calls.clone();
            let outcome = f
                .engine
                .fetch("/mf1/merchants", HttpMethod::Get, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(json!("fresh"))
                })
                .await
                .unwrap();
            assert_eq!(outcome.strategy, CacheStrategy::StaleWhileRevalidate);
            assert_eq!(outcome.data, json!("stale"));
        }

        assert_eq!(f.engine.refreshes_in_flight(), 1);
        gate.notify_one();

        loop {
            if let CacheEvent::Refreshed { key } = events.recv().await.unwrap() {
                assert_eq!(key, "/mf1/merchants");
                break;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.cache.get("/mf1/merchants").await.unwrap().unwrap().data, json!("fresh"));

        // The key is released once the refresh finishes.
        for _ in 0..100 {
            if f.engine.refreshes_in_flight() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.engine.refreshes_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_cached_entry() {
        let f = fixture("3g", 200);
        f.cache
            .set("/mf1/suppliers", json!("stale"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(5));
        let mut events = f.engine.subscribe();

        f.engine
            .fetch("/mf1/suppliers", HttpMethod::Get, network_down())
            .await
            .unwrap();

        loop {
            if let CacheEvent::RefreshFailed { key, .. } = events.recv().await.unwrap() {
                assert_eq!(key, "/mf1/suppliers");
                break;
            }
        }
        assert_eq!(f.cache.get("/mf1/suppliers").await.unwrap().unwrap().data, json!("stale"));
    }

    #[tokio::test]
    async fn test_invalidation_after_receipt_creation() {
        let f = fixture("4g", 30);
        for key in ["/mf1/receipts", "/mf1/receipts?page=2", "/mf1/merchants"] {
            f.cache.set(key, json!([]), None).await.unwrap();
        }

        let removed = f
            .engine
            .invalidate_after_mutation("/mf1/receipts", HttpMethod::Post)
            .await;

        assert_eq!(removed, 2);
        assert_eq!(f.cache.keys().await.unwrap(), vec!["/mf1/merchants".to_string()]);
    }

    struct BrokenCache;

    #[async_trait::async_trait]
    impl CacheAdapter for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<CachedItem>> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn set(&self, _key: &str, _data: serde_json::Value, _ttl: Option<Duration>) -> Result<()> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn set_item(&self, _key: &str, _item: CachedItem) -> Result<()> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn invalidate(&self, _pattern: &str) -> Result<usize> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn clear(&self) -> Result<()> {
            Ok(())
        }
        async fn size(&self) -> Result<usize> {
            Ok(0)
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_cache_errors_never_surface() {
        let monitor = Arc::new(ManualNetworkMonitor::new(true));
        let engine = CacheStrategyEngine::new(
            Arc::new(BrokenCache),
            EndpointClassifier::new(CacheConfig::default()).unwrap(),
            QualityAssessor::new(monitor),
        );

        let outcome = engine
            .fetch("/mf1/merchants", HttpMethod::Get, ok(json!("live")))
            .await
            .unwrap();
        assert_eq!(outcome.data, json!("live"));

        assert_eq!(
            engine
                .invalidate_after_mutation("/mf1/merchants/m-1", HttpMethod::Put)
                .await,
            0
        );
    }
}
