//! Retrying HTTP transport.
//!
//! This module executes single requests against the network:
//!
//! - Per-request connect and read timeouts
//! - Header injection with replace or append semantics
//! - 301/302 redirect following, bounded independently of retries
//! - Fixed-interval retry of transient failures
//! - Gzip decompression, buffered or streamed bodies
//! - File-download mode with a streaming SHA-256 checksum
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use courier_core::request::Request;
//! use courier_core::transport::TransportClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TransportClient::new(Duration::from_secs(30))?;
//! let request = Request::builder("https://example.com/feed.json").build()?;
//! let adapter = client.execute(&request, None).await;
//! println!("ok={} status={:?}", adapter.is_ok(), adapter.http_status());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod connectivity;
pub mod constants;
mod download;
mod error;
mod retry;

pub use client::TransportClient;
pub use connectivity::{ConnectivityProbe, NetworkMonitor};
pub use constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_REDIRECTS, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL_MS,
};
pub use error::TransportError;
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
