//! Courier Core Library
//!
//! Client-side HTTP request engine: callers describe requests, the engine
//! runs them on a bounded worker pool, serves repeat requests from a
//! two-tier cache, and hands replies to registered processors that turn
//! raw bytes into typed results.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`request`] - Request descriptors and their builder
//! - [`transport`] - Retrying HTTP client, downloads, connectivity probing
//! - [`cache`] - Memory LRU plus persistent SQLite-indexed blob store with TTL
//! - [`processor`] - Processor trait, built-in processors, and the registry
//! - [`engine`] - Worker pool and the request engine (`run_async` / `run_sync`)
//! - [`binding`] - Queuing facade for an engine that may not be bound yet
//! - [`deferred`] - Priority queue of deferred low-priority work
//! - [`config`] - Engine configuration file parsing and validation
//! - [`db`] - Database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod binding;
pub mod cache;
pub mod config;
pub mod db;
pub mod deferred;
pub mod delivery;
pub mod engine;
pub mod processor;
pub mod reply;
pub mod request;
#[cfg(test)]
pub mod test_support;
pub mod transport;

// Re-export commonly used types
pub use binding::{BindingState, DisconnectOutcome, EngineBinding, Submission};
pub use cache::{
    BulkInsertReport, CacheError, CacheLayer, CacheRecord, CacheStats, CachedObject, CachedValue,
    Provenance, RecordStore, SqliteRecordStore,
};
pub use config::{ConfigError, EngineConfig, parse_config_str};
pub use db::{Database, DbError};
pub use deferred::{DeferredListener, DeferredQueue, DeferredTask, Priority, TaskId};
pub use delivery::{CallbackSink, Delivery, DeliverySink, Payload, ProgressListener};
pub use engine::{
    EngineError, EngineStats, RequestEngine, RequestHandle, ResultContainer, WorkerPool,
};
pub use processor::{
    BytesProcessor, DownloadedFile, JsonProcessor, Processor, ProcessorError, ProcessorRegistry,
    StreamedBody, SyncProcessor, TextProcessor,
};
pub use reply::{Reply, ReplyAdapter, ReplyBody};
pub use request::{
    CACHE_FOREVER_MS, CacheTime, Method, NO_CACHE_MS, ProcessorId, Request, RequestBuilder,
    RequestError, RequestId, UNSET_PROCESSOR,
};
pub use transport::{ConnectivityProbe, NetworkMonitor, TransportClient, TransportError};
