//! Request engine: cache lookup, pooled network attempts, processor dispatch.
//!
//! Both entry points follow the same path:
//!
//! 1. Resolve the request's processor (fail fast if unset or unregistered)
//! 2. Look the URL up in the cache; a hit goes straight to the processor
//! 3. Otherwise run the transport attempt on the [`WorkerPool`]
//! 4. Dispatch the reply to the processor and persist successful bodies
//!
//! [`RequestEngine::run_async`] returns at once and reports through a
//! [`DeliverySink`]. [`RequestEngine::run_sync`] returns a
//! [`ResultContainer`] and additionally runs the connectivity pre-check
//! before touching the network.
//!
//! Each request delivers at most once: the dispatch task and
//! [`RequestEngine::cancel`] race to remove the request from the in-flight
//! map, and only the winner proceeds.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier_core::config::EngineConfig;
//! use courier_core::engine::RequestEngine;
//! use courier_core::processor::TextProcessor;
//! use courier_core::request::Request;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let engine = RequestEngine::open(config.clone()).await?;
//! engine.register(Arc::new(TextProcessor::new(1)))?;
//!
//! let request = Request::builder_with("https://example.com/", &config).processor(1).build()?;
//! let result = engine.run_sync(request).await?;
//! if let Some(text) = result.payload_as::<String>() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod pool;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};

pub use error::EngineError;
pub use pool::{PoolHandle, WorkerPool};

use crate::cache::{CacheLayer, CachedObject, CachedValue, Provenance};
use crate::config::EngineConfig;
use crate::delivery::{Delivery, DeliverySink, Payload, ProgressListener};
use crate::processor::{
    Processor, ProcessorError, ProcessorRegistry, dispatch_cached, dispatch_reply, extract_cached,
    extract_reply,
};
use crate::reply::{ReplyAdapter, ReplyBody};
use crate::request::{Request, RequestId};
use crate::transport::connectivity::is_reachable;
use crate::transport::{ConnectivityProbe, NetworkMonitor, TransportClient};

/// Outcome of a synchronous run.
#[derive(Default)]
pub struct ResultContainer {
    /// Whether a payload was produced.
    pub successful: bool,
    /// Processor output.
    pub payload: Option<Payload>,
    /// HTTP status of the live reply, if there was one.
    pub status: Option<u16>,
    /// Headers of the live reply, if there was one.
    pub headers: Option<HeaderMap>,
    /// Cause of failure.
    pub error: Option<EngineError>,
    /// Tier the payload was served from, if it came from cache.
    pub provenance: Option<Provenance>,
}

impl fmt::Debug for ResultContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultContainer")
            .field("successful", &self.successful)
            .field("has_payload", &self.payload.is_some())
            .field("status", &self.status)
            .field("error", &self.error)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

impl ResultContainer {
    fn success(payload: Payload) -> Self {
        Self {
            successful: true,
            payload: Some(payload),
            ..Self::default()
        }
    }

    fn failure(error: EngineError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    fn with_reply_meta(mut self, adapter: &ReplyAdapter) -> Self {
        if let Some(reply) = adapter.reply() {
            self.status = Some(reply.status);
            self.headers = Some(reply.headers.clone());
        }
        self
    }

    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.provenance.is_some()
    }

    /// Downcasts the payload.
    #[must_use]
    pub fn payload_as<T: std::any::Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }
}

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    served_from_cache: AtomicUsize,
    cancelled: AtomicUsize,
}

impl EngineStats {
    /// Successful results, including cache hits.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn served_from_cache(&self) -> usize {
        self.served_from_cache.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn record(&self, successful: bool, from_cache: bool) {
        if successful {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        if from_cache {
            self.served_from_cache.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Bookkeeping for a request that has not delivered yet.
struct InFlight {
    request: Request,
    /// Dispatch task of an async run.
    task: Option<AbortHandle>,
    /// Pool work currently running the transport attempt.
    work: Option<AbortHandle>,
}

struct EngineInner {
    config: EngineConfig,
    registry: ProcessorRegistry,
    cache: Arc<CacheLayer>,
    transport: TransportClient,
    probe: Arc<dyn ConnectivityProbe>,
    pool: WorkerPool,
    in_flight: DashMap<RequestId, InFlight>,
    stats: EngineStats,
}

/// Cheaply cloneable handle to a running engine.
#[derive(Clone)]
pub struct RequestEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for RequestEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEngine")
            .field("pool_size", &self.inner.pool.size())
            .field("processors", &self.inner.registry.ids())
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`RequestEngine::run_async`].
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: RequestId,
    task: AbortHandle,
    engine: Weak<EngineInner>,
}

impl RequestHandle {
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Whether the dispatch task has ended (delivered, failed or cancelled).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the request. Returns `false` if it already delivered or was cancelled.
    pub fn cancel(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|inner| cancel_in_flight(&inner, self.id))
    }
}

impl fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInner").finish_non_exhaustive()
    }
}

impl RequestEngine {
    /// Assembles an engine from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `config` fails validation, or
    /// [`EngineError::InvalidPoolSize`].
    pub fn new(
        config: EngineConfig,
        cache: Arc<CacheLayer>,
        transport: TransportClient,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let pool = WorkerPool::new(config.pool_size)?;
        info!(
            pool_size = config.pool_size,
            memory_cache_capacity = config.memory_cache_capacity,
            "request engine started"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                registry: ProcessorRegistry::new(),
                cache,
                transport,
                probe,
                pool,
                in_flight: DashMap::new(),
                stats: EngineStats::default(),
            }),
        })
    }

    /// Opens the cache under `config.cache_dir` and builds the default
    /// transport and network monitor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the config is invalid or the cache or HTTP
    /// client cannot be created.
    #[instrument(skip(config), fields(cache_dir = %config.cache_dir.display()))]
    pub async fn open(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = CacheLayer::open(&config.cache_dir, config.memory_cache_capacity).await?;
        let transport =
            TransportClient::with_max_redirects(config.connect_timeout(), config.max_redirects)
                .map_err(|e| EngineError::transport(Arc::new(e)))?;
        let probe = Arc::new(NetworkMonitor::new(config.ping_url.clone()));
        Self::new(config, Arc::new(cache), transport, probe)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.inner.cache
    }

    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.inner.stats
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Requests that have not delivered yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Registers a processor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Processor`] on an unset id, collision, or duplicate.
    pub fn register(&self, processor: Arc<dyn Processor>) -> Result<(), EngineError> {
        Ok(self.inner.registry.register(processor)?)
    }

    /// Starts `request` without waiting for it. The result arrives at `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Processor`] if the request's processor is unset
    /// or unregistered. No delivery is made in that case.
    pub fn run_async(
        &self,
        request: Request,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<RequestHandle, EngineError> {
        self.submit(request, sink, None)
    }

    /// Like [`run_async`](Self::run_async) with a download progress listener.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Processor`] if the request's processor is unset
    /// or unregistered.
    pub fn submit(
        &self,
        request: Request,
        sink: Arc<dyn DeliverySink>,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<RequestHandle, EngineError> {
        let processor = self.inner.registry.resolve(&request)?;
        let id = request.id();
        self.inner.in_flight.insert(
            id,
            InFlight {
                request: request.clone(),
                task: None,
                work: None,
            },
        );

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let delivery = inner
                .resolve_delivery(&request, processor.as_ref(), progress)
                .await;
            if inner.in_flight.remove(&id).is_none() {
                debug!(request_id = %id, "request cancelled, dropping delivery");
                return;
            }
            inner.stats.record(delivery.success, delivery.from_cache);
            sink.deliver(delivery);
        });

        let abort = task.abort_handle();
        if let Some(mut entry) = self.inner.in_flight.get_mut(&id) {
            entry.task = Some(abort.clone());
        }
        debug!(request_id = %id, "request dispatched");
        Ok(RequestHandle {
            id,
            task: abort,
            engine: Arc::downgrade(&self.inner),
        })
    }

    /// Runs `request` to completion and returns its result directly.
    ///
    /// Failures after dispatch (network, parsing, connectivity, cancellation)
    /// arrive as a container with `successful == false`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Processor`] if the processor is unset,
    /// unregistered, or has no synchronous capability.
    pub async fn run_sync(&self, request: Request) -> Result<ResultContainer, EngineError> {
        self.run_sync_with(request, None).await
    }

    /// Like [`run_sync`](Self::run_sync) with a download progress listener.
    ///
    /// # Errors
    ///
    /// Same as [`run_sync`](Self::run_sync).
    #[instrument(skip(self, request, progress), fields(request_id = %request.id(), url = %request.url()))]
    pub async fn run_sync_with(
        &self,
        request: Request,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<ResultContainer, EngineError> {
        let processor = self.inner.registry.resolve(&request)?;
        if processor.as_sync().is_none() {
            return Err(ProcessorError::SyncUnsupported {
                processor_id: processor.id(),
            }
            .into());
        }

        let id = request.id();
        self.inner.in_flight.insert(
            id,
            InFlight {
                request: request.clone(),
                task: None,
                work: None,
            },
        );
        let _guard = InFlightGuard {
            inner: &self.inner,
            id,
        };

        let container = self
            .inner
            .resolve_sync(&request, processor.as_ref(), progress)
            .await;
        if self.inner.in_flight.remove(&id).is_none() {
            debug!(request_id = %id, "request cancelled during synchronous run");
            return Ok(ResultContainer::failure(EngineError::Cancelled));
        }
        self.inner
            .stats
            .record(container.successful, container.from_cache());
        Ok(container)
    }

    /// Runs [`run_sync`](Self::run_sync) on `handle` from a thread outside the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Reentrant`] when called from inside a tokio
    /// runtime (including delivery callbacks), where blocking would stall
    /// the worker the result depends on. Otherwise as [`run_sync`](Self::run_sync).
    pub fn run_blocking(
        &self,
        handle: &Handle,
        request: Request,
    ) -> Result<ResultContainer, EngineError> {
        if Handle::try_current().is_ok() {
            warn!(request_id = %request.id(), "blocking engine call from inside the runtime rejected");
            return Err(EngineError::Reentrant);
        }
        handle.block_on(self.run_sync(request))
    }

    /// Cancels an in-flight request.
    ///
    /// Sets the request's cancellation flag and aborts its work. Returns
    /// `false` if the id is unknown, already delivered, or already cancelled.
    pub fn cancel(&self, id: RequestId) -> bool {
        cancel_in_flight(&self.inner, id)
    }
}

fn cancel_in_flight(inner: &EngineInner, id: RequestId) -> bool {
    let Some((_, entry)) = inner.in_flight.remove(&id) else {
        return false;
    };
    entry.request.mark_cancelled();
    if let Some(task) = entry.task {
        task.abort();
    }
    if let Some(work) = entry.work {
        work.abort();
    }
    inner.stats.cancelled.fetch_add(1, Ordering::SeqCst);
    info!(request_id = %id, url = %entry.request.url(), "request cancelled");
    true
}

/// Drops the in-flight entry of a synchronous run if its future is dropped early.
struct InFlightGuard<'a> {
    inner: &'a EngineInner,
    id: RequestId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.id);
    }
}

impl EngineInner {
    async fn resolve_delivery(
        &self,
        request: &Request,
        processor: &dyn Processor,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Delivery {
        if let Some(cached) = self.cached_for(request, processor).await {
            debug!(request_id = %request.id(), provenance = ?cached.provenance, "serving from cache");
            return dispatch_cached(processor, request, &cached);
        }

        let adapter = match self.fetch(request, progress).await {
            Ok(adapter) => adapter,
            Err(error) => return Delivery::failure(processor.id(), request.id(), error),
        };
        let delivery = dispatch_reply(processor, &adapter);
        if delivery.success {
            self.persist(request, processor, &adapter, delivery.payload.as_ref())
                .await;
        }
        delivery
    }

    async fn resolve_sync(
        &self,
        request: &Request,
        processor: &dyn Processor,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> ResultContainer {
        if let Some(cached) = self.cached_for(request, processor).await {
            return match extract_cached(processor, &cached) {
                Ok(payload) => ResultContainer {
                    provenance: Some(cached.provenance),
                    ..ResultContainer::success(payload)
                },
                Err(error) => ResultContainer {
                    provenance: Some(cached.provenance),
                    ..ResultContainer::failure(error.into())
                },
            };
        }

        if !is_reachable(self.probe.as_ref(), request).await {
            info!(request_id = %request.id(), url = %request.url(), "offline and not cached");
            return ResultContainer::failure(EngineError::Offline);
        }

        let adapter = match self.fetch(request, progress).await {
            Ok(adapter) => adapter,
            Err(error) => return ResultContainer::failure(error),
        };
        if !adapter.is_ok() {
            let error = adapter.error().map_or(EngineError::Cancelled, |error| {
                EngineError::transport(Arc::clone(error))
            });
            return ResultContainer::failure(error).with_reply_meta(&adapter);
        }

        match extract_reply(processor, &adapter) {
            Ok(payload) => {
                self.persist(request, processor, &adapter, Some(&payload))
                    .await;
                ResultContainer::success(payload).with_reply_meta(&adapter)
            }
            Err(error) => ResultContainer::failure(error.into()).with_reply_meta(&adapter),
        }
    }

    /// Cache lookup honoring the request's cache policy.
    ///
    /// A memory entry stored for a different processor is skipped in favour
    /// of the persistent tier.
    async fn cached_for(&self, request: &Request, processor: &dyn Processor) -> Option<CachedObject> {
        if !request.uses_cache() || request.download().is_some() {
            return None;
        }
        let cached = self.cache.lookup(request.url()).await?;
        if cached.provenance == Provenance::Memory && cached.tag != Some(processor.id()) {
            return self.cache.lookup_persistent(request.url()).await;
        }
        Some(cached)
    }

    /// Runs the transport attempt on the pool.
    async fn fetch(
        &self,
        request: &Request,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<ReplyAdapter, EngineError> {
        let transport = self.transport.clone();
        let attempt = request.clone();
        let handle = self
            .pool
            .submit(async move { transport.execute(&attempt, progress).await });
        match self.in_flight.get_mut(&request.id()) {
            Some(mut entry) => entry.work = Some(handle.abort_handle()),
            None => {
                // Cancelled between lookup and submission.
                handle.abort();
                return Err(EngineError::Cancelled);
            }
        }
        handle.await
    }

    /// Writes a successful reply to the cache tiers.
    ///
    /// Only buffered bodies are cached: the parsed object in memory, the raw
    /// bytes on disk. Failures are logged and otherwise ignored.
    async fn persist(
        &self,
        request: &Request,
        processor: &dyn Processor,
        adapter: &ReplyAdapter,
        payload: Option<&Payload>,
    ) {
        if !request.uses_cache() {
            return;
        }
        let Some(reply) = adapter.reply() else {
            return;
        };
        let ReplyBody::Bytes(bytes) = &reply.body else {
            return;
        };

        if let Some(payload) = payload {
            self.cache.put_memory(
                request.url(),
                processor.id(),
                CachedValue::Object(Arc::clone(payload)),
            );
        }
        if !processor.should_persist(reply) {
            return;
        }
        let record = self.cache.new_record(
            request.url(),
            request.cache_time(),
            request.offline_cache(),
        );
        if let Err(error) = self.cache.put(&record, bytes).await {
            warn!(url = %request.url(), error = %error, "failed to persist reply to cache");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::{BlobStore, SqliteRecordStore};
    use crate::db::Database;
    use crate::processor::{BytesProcessor, TextProcessor};
    use crate::request::{CacheTime, Method};

    struct SwitchProbe(AtomicBool);

    #[async_trait]
    impl ConnectivityProbe for SwitchProbe {
        fn link_up(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    struct AsyncOnly;

    impl Processor for AsyncOnly {
        fn id(&self) -> crate::request::ProcessorId {
            77
        }

        fn parse_bytes(&self, bytes: &Bytes) -> Result<Payload, ProcessorError> {
            Ok(Arc::new(bytes.len()))
        }
    }

    async fn engine(temp: &TempDir, link_up: bool) -> RequestEngine {
        let store = Arc::new(SqliteRecordStore::new(Database::new_in_memory().await.unwrap()));
        let cache = Arc::new(CacheLayer::new(store, BlobStore::new(temp.path()), 8));
        let transport = TransportClient::new(Duration::from_secs(2)).unwrap();
        let probe = Arc::new(SwitchProbe(AtomicBool::new(link_up)));
        RequestEngine::new(EngineConfig::default(), cache, transport, probe).unwrap()
    }

    // Port 9 (discard) on localhost refuses connections in test environments.
    const UNREACHABLE: &str = "http://127.0.0.1:9/resource";

    #[tokio::test]
    async fn test_unregistered_processor_fails_fast() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, true).await;
        let request = Request::builder(UNREACHABLE).processor(3).build().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let err = engine.run_async(request, Arc::new(tx)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Processor(ProcessorError::NotRegistered { processor_id: 3, .. })
        ));
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unset_processor_fails_fast_in_sync_path() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, true).await;
        let request = Request::builder(UNREACHABLE).build().unwrap();
        let err = engine.run_sync(request).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Processor(ProcessorError::UnsetId { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_requires_sync_capable_processor() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, true).await;
        engine.register(Arc::new(AsyncOnly)).unwrap();
        let request = Request::builder(UNREACHABLE).processor(77).build().unwrap();
        let err = engine.run_sync(request).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Processor(ProcessorError::SyncUnsupported { processor_id: 77 })
        ));
    }

    #[tokio::test]
    async fn test_offline_sync_without_cache_fails_without_reply() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, false).await;
        engine.register(Arc::new(TextProcessor::new(1))).unwrap();
        let request = Request::builder(UNREACHABLE).processor(1).build().unwrap();

        let result = engine.run_sync(request).await.unwrap();
        assert!(!result.successful);
        assert!(matches!(result.error, Some(EngineError::Offline)));
        assert!(result.status.is_none());
        assert_eq!(engine.stats().failed(), 1);
    }

    #[tokio::test]
    async fn test_offline_sync_is_served_from_cache() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, false).await;
        engine.register(Arc::new(TextProcessor::new(1))).unwrap();
        let record = engine.cache().new_record(UNREACHABLE, CacheTime::Forever, true);
        engine.cache().put(&record, b"stored").await.unwrap();

        let request = Request::builder(UNREACHABLE).processor(1).build().unwrap();
        let result = engine.run_sync(request).await.unwrap();
        assert!(result.successful);
        assert_eq!(result.provenance, Some(Provenance::File));
        assert_eq!(result.payload_as::<String>().unwrap(), "stored");
        assert_eq!(engine.stats().served_from_cache(), 1);
    }

    #[tokio::test]
    async fn test_memory_entry_for_other_processor_falls_through_to_file() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, false).await;
        engine.register(Arc::new(TextProcessor::new(1))).unwrap();
        engine.register(Arc::new(BytesProcessor::new(2))).unwrap();
        let record = engine.cache().new_record(UNREACHABLE, CacheTime::Forever, false);
        engine.cache().put(&record, b"raw").await.unwrap();
        engine
            .cache()
            .put_memory(UNREACHABLE, 1, CachedValue::Object(Arc::new("parsed".to_string())));

        let request = Request::builder(UNREACHABLE).processor(2).build().unwrap();
        let result = engine.run_sync(request).await.unwrap();
        assert_eq!(result.provenance, Some(Provenance::File));
        assert_eq!(result.payload_as::<Bytes>().unwrap().as_ref(), b"raw");
    }

    #[tokio::test]
    async fn test_post_requests_bypass_cache() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, false).await;
        engine.register(Arc::new(TextProcessor::new(1))).unwrap();
        let record = engine.cache().new_record(UNREACHABLE, CacheTime::Forever, false);
        engine.cache().put(&record, b"stored").await.unwrap();

        let request = Request::builder(UNREACHABLE)
            .method(Method::Post)
            .processor(1)
            .build()
            .unwrap();
        let result = engine.run_sync(request).await.unwrap();
        assert!(!result.successful);
        assert!(matches!(result.error, Some(EngineError::Offline)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_noop() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, true).await;
        let request = Request::builder(UNREACHABLE).build().unwrap();
        assert!(!engine.cancel(request.id()));
        assert_eq!(engine.stats().cancelled(), 0);
    }

    #[tokio::test]
    async fn test_run_blocking_inside_runtime_is_rejected() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, true).await;
        engine.register(Arc::new(TextProcessor::new(1))).unwrap();
        let request = Request::builder(UNREACHABLE).processor(1).build().unwrap();
        let handle = Handle::current();
        assert!(matches!(
            engine.run_blocking(&handle, request),
            Err(EngineError::Reentrant)
        ));
    }

    #[test]
    fn test_run_blocking_outside_runtime_completes() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let temp = TempDir::new().unwrap();
        let engine = runtime.block_on(engine(&temp, false));
        engine.register(Arc::new(TextProcessor::new(1))).unwrap();
        let request = Request::builder(UNREACHABLE).processor(1).build().unwrap();

        let result = engine.run_blocking(runtime.handle(), request).unwrap();
        assert!(matches!(result.error, Some(EngineError::Offline)));
    }
}
