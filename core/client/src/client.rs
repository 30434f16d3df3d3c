//! Client facade wiring every component together.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use fiscalgate_auth::{
    AuthModeResolver, Certificate, CertificateInfo, CertificateStatus, CertificateStore,
    MtlsTransport, ReqwestMtlsTransport, ReqwestTokenTransport, SessionProvider, StaticSession,
    TokenTransport,
};
use fiscalgate_cache::{CacheStrategyEngine, EndpointClassifier, QualityAssessor};
use fiscalgate_common::{system_clock, RequestConfig, Result, SharedClock};
use fiscalgate_storage::{
    CacheAdapter, MemoryCacheAdapter, MemorySecureStorage, NetworkMonitor, ProbeNetworkMonitor,
    SecureStorage,
};
use fiscalgate_sync::{
    OfflineModeStateMachine, OfflineOperationQueue, OfflineState, Priority, QueueStats,
    SyncManager, SyncMode, SyncReport, SyncScheduler,
};

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatched, ReplayExecutor, RequestDispatcher, Response};

/// How often the offline watcher re-evaluates the emergency timeout.
const OFFLINE_TICK: Duration = Duration::from_secs(30);

/// Builder for [`FiscalClient`].
///
/// Every collaborator defaults to a production implementation: reqwest
/// transports, an HTTP probe monitor, and in-memory storage and cache.
pub struct FiscalClientBuilder {
    config: ClientConfig,
    storage: Option<Arc<dyn SecureStorage>>,
    cache: Option<Arc<dyn CacheAdapter>>,
    monitor: Option<Arc<dyn NetworkMonitor>>,
    mtls: Option<Arc<dyn MtlsTransport>>,
    token: Option<Arc<dyn TokenTransport>>,
    session: Option<Arc<dyn SessionProvider>>,
    clock: SharedClock,
}

impl FiscalClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            storage: None,
            cache: None,
            monitor: None,
            mtls: None,
            token: None,
            session: None,
            clock: system_clock(),
        }
    }

    /// Persistent storage for the certificate and the offline queue.
    pub fn storage(mut self, storage: Arc<dyn SecureStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheAdapter>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn mtls_transport(mut self, mtls: Arc<dyn MtlsTransport>) -> Self {
        self.mtls = Some(mtls);
        self
    }

    pub fn token_transport(mut self, token: Arc<dyn TokenTransport>) -> Self {
        self.token = Some(token);
        self
    }

    pub fn session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Wire the client and load the offline queue.
    ///
    /// # Errors
    /// - Invalid API URL or auth patterns
    /// - Queue storage read failure or corrupt queue
    pub async fn build(self) -> Result<FiscalClient> {
        let config = self.config;
        let clock = self.clock;

        let storage: Arc<dyn SecureStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemorySecureStorage::new()),
        };
        let cache: Arc<dyn CacheAdapter> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(MemoryCacheAdapter::with_clock(clock.clone())),
        };

        let mut probe = None;
        let monitor: Arc<dyn NetworkMonitor> = match self.monitor {
            Some(monitor) => monitor,
            None => {
                let monitor = Arc::new(ProbeNetworkMonitor::new(config.probe_url())?);
                probe = Some(monitor.clone());
                monitor
            }
        };

        let mtls: Arc<dyn MtlsTransport> = match self.mtls {
            Some(mtls) => mtls,
            None => Arc::new(
                ReqwestMtlsTransport::new(&config.api_base_url, config.mtls_port)?
                    .with_probe_path(config.probe_path.clone())
                    .with_timeout(config.request_timeout),
            ),
        };
        let token: Arc<dyn TokenTransport> = match self.token {
            Some(token) => token,
            None => Arc::new(
                ReqwestTokenTransport::new(config.api_base_url.clone())?
                    .with_timeout(config.request_timeout),
            ),
        };
        let session: Arc<dyn SessionProvider> = match self.session {
            Some(session) => session,
            None => Arc::new(StaticSession::new()),
        };

        let store = CertificateStore::new(storage.clone()).with_clock(clock.clone());
        let resolver = Arc::new(AuthModeResolver::new(
            config.auth.clone(),
            store,
            mtls,
            token,
            session,
        )?);

        let classifier = EndpointClassifier::new(config.cache.clone())?;
        let assessor = QualityAssessor::new(monitor.clone())
            .with_clock(clock.clone())
            .with_ttl(config.cache.quality_ttl);
        let engine = Arc::new(
            CacheStrategyEngine::new(cache, classifier, assessor).with_clock(clock.clone()),
        );

        let queue = Arc::new(
            OfflineOperationQueue::load(storage, config.queue.clone(), clock.clone()).await?,
        );
        let offline = Arc::new(OfflineModeStateMachine::new(
            monitor.is_online(),
            config.offline.clone(),
            clock.clone(),
        ));

        let executor = Arc::new(ReplayExecutor::new(resolver.clone(), engine.clone()));
        let sync = Arc::new(
            SyncManager::new(queue.clone(), executor, monitor.clone(), config.sync.clone())
                .with_offline_state(offline.clone())
                .with_clock(clock),
        );

        let dispatcher = RequestDispatcher::new(
            resolver.clone(),
            engine.clone(),
            queue.clone(),
            offline.clone(),
            monitor.clone(),
        );

        info!(api = %config.api_base_url, "Fiscal client ready");
        Ok(FiscalClient {
            config,
            resolver,
            engine,
            queue,
            offline,
            sync,
            dispatcher,
            monitor,
            probe,
        })
    }
}

/// Background tasks started by [`FiscalClient::start`].
///
/// Dropping the handle leaves the tasks running; call
/// [`shutdown`](Self::shutdown) to stop them.
pub struct BackgroundTasks {
    scheduler: SyncScheduler,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Front end of the running sync scheduler.
    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// Stop the scheduler and abort the watchers.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Resilient client for the fiscal-receipt API.
pub struct FiscalClient {
    config: ClientConfig,
    resolver: Arc<AuthModeResolver>,
    engine: Arc<CacheStrategyEngine>,
    queue: Arc<OfflineOperationQueue>,
    offline: Arc<OfflineModeStateMachine>,
    sync: Arc<SyncManager>,
    dispatcher: RequestDispatcher,
    monitor: Arc<dyn NetworkMonitor>,
    probe: Option<Arc<ProbeNetworkMonitor>>,
}

impl FiscalClient {
    pub fn builder(config: ClientConfig) -> FiscalClientBuilder {
        FiscalClientBuilder::new(config)
    }

    /// Spawn the network probe (when the client owns it), the offline
    /// watcher and the sync scheduler.
    pub fn start(&self, mode: SyncMode) -> BackgroundTasks {
        let mut tasks = Vec::new();
        if let Some(probe) = &self.probe {
            tasks.push(tokio::spawn(probe.clone().run()));
        }
        tasks.push(tokio::spawn(
            self.offline
                .clone()
                .watch_connectivity(self.monitor.subscribe(), OFFLINE_TICK),
        ));

        let (scheduler, handle) = SyncScheduler::new(mode);
        tasks.push(tokio::spawn(
            handle.run(self.sync.clone(), self.monitor.subscribe()),
        ));

        BackgroundTasks { scheduler, tasks }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn resolver(&self) -> &Arc<AuthModeResolver> {
        &self.resolver
    }

    pub fn cache_engine(&self) -> &Arc<CacheStrategyEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<OfflineOperationQueue> {
        &self.queue
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn offline_state(&self) -> OfflineState {
        self.offline.state()
    }

    pub fn offline(&self) -> &Arc<OfflineModeStateMachine> {
        &self.offline
    }

    /// See [`RequestDispatcher::dispatch`].
    pub async fn request(&self, request: RequestConfig) -> Result<Dispatched<Response>> {
        self.dispatcher.dispatch(request).await
    }

    /// See [`RequestDispatcher::dispatch_with_priority`].
    pub async fn request_with_priority(
        &self,
        request: RequestConfig,
        priority: Priority,
    ) -> Result<Dispatched<Response>> {
        self.dispatcher.dispatch_with_priority(request, priority).await
    }

    /// Drain the offline queue now.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.sync.drain().await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Store a client certificate and configure the mTLS transport with it.
    pub async fn store_certificate(&self, certificate: &Certificate) -> Result<CertificateInfo> {
        self.resolver.store_certificate(certificate).await
    }

    pub async fn remove_certificate(&self) -> Result<()> {
        self.resolver.remove_certificate().await
    }

    pub async fn certificate_status(&self) -> Result<CertificateStatus> {
        self.resolver.certificate_status().await
    }
}
