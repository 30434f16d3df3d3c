//! One call from the application to the API.
//!
//! Reads run through the cache strategy engine with the authenticated call
//! as the fetch step. Writes go straight to the resolver; a successful write
//! invalidates the cache, and a write that cannot reach the server is
//! deferred to the offline queue (or the best-effort buffer in emergency
//! mode) instead of failing.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use fiscalgate_auth::AuthModeResolver;
use fiscalgate_cache::{CacheStrategy, CacheStrategyEngine, ServedFrom};
use fiscalgate_common::{ApiResponse, Error, RequestConfig, Result};
use fiscalgate_storage::NetworkMonitor;
use fiscalgate_sync::{
    resource_of, OfflineModeStateMachine, OfflineOperationQueue, OperationExecutor, OperationType,
    Priority, QueuedOperation,
};

/// Data returned for a call that was answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub data: serde_json::Value,
    /// HTTP status, when the data came straight from a server response.
    pub status: Option<u16>,
    pub served_from: ServedFrom,
    /// Cache strategy applied to a read.
    pub strategy: Option<CacheStrategy>,
}

impl Response {
    fn from_api(response: ApiResponse) -> Self {
        Self {
            data: response.data,
            status: Some(response.status),
            served_from: ServedFrom::Network,
            strategy: None,
        }
    }
}

/// What happened to a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched<T> {
    /// The server (or, for reads, the cache) answered.
    Completed(T),
    /// The write was persisted to the offline queue.
    Queued { id: String },
    /// The write is held in memory only and is lost if the process exits.
    BufferedBestEffort { id: String },
}

impl<T> Dispatched<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Dispatched::Completed(_))
    }

    /// Whether the write still has to reach the server.
    pub fn is_deferred(&self) -> bool {
        !self.is_completed()
    }

    /// Completed value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            Dispatched::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Convert the completed value, keeping deferred outcomes.
    pub fn try_map<U>(self, f: impl FnOnce(T) -> Result<U>) -> Result<Dispatched<U>> {
        Ok(match self {
            Dispatched::Completed(value) => Dispatched::Completed(f(value)?),
            Dispatched::Queued { id } => Dispatched::Queued { id },
            Dispatched::BufferedBestEffort { id } => Dispatched::BufferedBestEffort { id },
        })
    }
}

/// Composes auth resolution, caching and offline deferral for each call.
pub struct RequestDispatcher {
    resolver: Arc<AuthModeResolver>,
    engine: Arc<CacheStrategyEngine>,
    queue: Arc<OfflineOperationQueue>,
    offline: Arc<OfflineModeStateMachine>,
    monitor: Arc<dyn NetworkMonitor>,
}

impl RequestDispatcher {
    pub fn new(
        resolver: Arc<AuthModeResolver>,
        engine: Arc<CacheStrategyEngine>,
        queue: Arc<OfflineOperationQueue>,
        offline: Arc<OfflineModeStateMachine>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Self {
        Self {
            resolver,
            engine,
            queue,
            offline,
            monitor,
        }
    }

    /// Dispatch a call; writes are deferred with normal priority.
    pub async fn dispatch(&self, request: RequestConfig) -> Result<Dispatched<Response>> {
        self.dispatch_with_priority(request, Priority::default()).await
    }

    /// Dispatch a call, deferring writes with `priority`.
    ///
    /// # Errors
    /// - `Error::OfflineNoCache` for a read with no connectivity and no cache
    /// - Auth, validation and server errors of the final channel
    /// - `Error::QueueFull` when a write cannot be deferred
    pub async fn dispatch_with_priority(
        &self,
        request: RequestConfig,
        priority: Priority,
    ) -> Result<Dispatched<Response>> {
        if request.method.is_mutating() {
            self.write(request, priority).await
        } else {
            self.read(request).await.map(Dispatched::Completed)
        }
    }

    /// Run a read through the cache strategy engine.
    pub async fn read(&self, request: RequestConfig) -> Result<Response> {
        let resolver = self.resolver.clone();
        let url = request.url.clone();
        let method = request.method;

        let outcome = self
            .engine
            .fetch(&url, method, move || async move {
                resolver.execute(&request).await.map(|response| response.data)
            })
            .await?;

        Ok(Response {
            data: outcome.data,
            status: None,
            served_from: outcome.served_from,
            strategy: Some(outcome.strategy),
        })
    }

    async fn write(&self, request: RequestConfig, priority: Priority) -> Result<Dispatched<Response>> {
        if !self.monitor.is_online() {
            debug!(url = %request.url, "Offline, deferring write");
            return self.defer(request, priority).await;
        }

        match self.resolver.execute(&request).await {
            Ok(response) => {
                self.offline.record_success();
                self.engine
                    .invalidate_after_mutation(&request.url, request.method)
                    .await;
                Ok(Dispatched::Completed(Response::from_api(response)))
            }
            Err(e) if e.is_connectivity() => {
                warn!(url = %request.url, "Write could not reach the server ({}), deferring", e);
                self.offline.record_failure();
                self.defer(request, priority).await
            }
            Err(e) => Err(e),
        }
    }

    async fn defer(&self, request: RequestConfig, priority: Priority) -> Result<Dispatched<Response>> {
        if !self.offline.accepts_durable_writes() {
            let id = self.offline.buffer_write(request, priority)?;
            return Ok(Dispatched::BufferedBestEffort { id });
        }

        let op_type = OperationType::for_method(request.method).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} calls cannot be queued",
                request.method.as_str()
            ))
        })?;
        let id = self
            .queue
            .enqueue(
                op_type,
                &resource_of(&request.url),
                &request.url,
                request.method,
                request.body,
                priority,
            )
            .await?;
        info!(id = %id, url = %request.url, "Write queued for sync");
        Ok(Dispatched::Queued { id })
    }

    /// Typed GET.
    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.read(RequestConfig::get(url)).await?;
        Ok(serde_json::from_value(response.data)?)
    }

    /// Typed POST.
    pub async fn post<B, T>(&self, url: &str, body: &B) -> Result<Dispatched<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = RequestConfig::post(url, serde_json::to_value(body)?);
        self.typed(request).await
    }

    /// Typed PUT.
    pub async fn put<B, T>(&self, url: &str, body: &B) -> Result<Dispatched<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = RequestConfig::put(url, serde_json::to_value(body)?);
        self.typed(request).await
    }

    /// Typed DELETE.
    pub async fn delete<T: DeserializeOwned>(&self, url: &str) -> Result<Dispatched<T>> {
        self.typed(RequestConfig::delete(url)).await
    }

    async fn typed<T: DeserializeOwned>(&self, request: RequestConfig) -> Result<Dispatched<T>> {
        self.dispatch(request)
            .await?
            .try_map(|response| Ok(serde_json::from_value(response.data)?))
    }
}

/// Replays queued operations through the resolver and invalidates the
/// cache after each success.
pub struct ReplayExecutor {
    resolver: Arc<AuthModeResolver>,
    engine: Arc<CacheStrategyEngine>,
}

impl ReplayExecutor {
    pub fn new(resolver: Arc<AuthModeResolver>, engine: Arc<CacheStrategyEngine>) -> Self {
        Self { resolver, engine }
    }
}

#[async_trait]
impl OperationExecutor for ReplayExecutor {
    async fn execute(&self, operation: &QueuedOperation) -> Result<ApiResponse> {
        let request = operation.to_request();
        let response = self.resolver.execute(&request).await?;
        self.engine
            .invalidate_after_mutation(&request.url, request.method)
            .await;
        Ok(response)
    }
}
