//! Request descriptors.
//!
//! A [`Request`] is built once by application code through a
//! [`RequestBuilder`] and is immutable after it is handed to the engine,
//! except for its cancellation flag which is shared with every clone.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use courier_core::request::{CacheTime, Method, Request};
//!
//! let request = Request::builder("https://example.com/feed.json")
//!     .method(Method::Get)
//!     .processor(7)
//!     .cache_time(CacheTime::Ttl(Duration::from_secs(3600)))
//!     .retries(2)
//!     .build()
//!     .unwrap();
//! assert_eq!(request.processor_id(), 7);
//! ```

use std::fmt;
use std::panic::Location;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

use crate::config::EngineConfig;

/// Integer identifier a [`Processor`](crate::processor::Processor) is registered under.
pub type ProcessorId = i32;

/// Sentinel for a request whose processor was never set.
pub const UNSET_PROCESSOR: ProcessorId = -1;

/// Stored cache-time value meaning "never cache".
///
/// Zero makes the expiry rule `(now - created) >= cache_time` hold for every
/// record, so a no-cache record is always expired.
pub const NO_CACHE_MS: i64 = 0;

/// Stored cache-time value meaning "cache forever".
pub const CACHE_FOREVER_MS: i64 = -1;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric id.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// HTTP methods supported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
}

impl Method {
    /// Returns the wire name of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a reply stays servable from cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTime {
    /// Never written, never served.
    NoCache,
    /// Never expires.
    Forever,
    /// Expires once this much time has passed since creation.
    Ttl(Duration),
}

impl CacheTime {
    /// Encodes the cache time for the record store.
    #[must_use]
    pub fn as_millis(self) -> i64 {
        match self {
            Self::NoCache => NO_CACHE_MS,
            Self::Forever => CACHE_FOREVER_MS,
            Self::Ttl(ttl) => i64::try_from(ttl.as_millis())
                .unwrap_or(i64::MAX)
                .max(1),
        }
    }

    /// Decodes a stored cache time. Unknown negative values are read as "no cache".
    #[must_use]
    pub fn from_millis(value: i64) -> Self {
        match value {
            CACHE_FOREVER_MS => Self::Forever,
            v if v <= NO_CACHE_MS => Self::NoCache,
            v => Self::Ttl(Duration::from_millis(v.unsigned_abs())),
        }
    }

    /// Returns true unless this is [`CacheTime::NoCache`].
    #[must_use]
    pub fn is_cacheable(self) -> bool {
        self != Self::NoCache
    }
}

/// Destination for file-download mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    /// Final path of the downloaded file.
    pub path: PathBuf,
    /// Expected lowercase hex SHA-256 of the body, verified before commit.
    pub expected_sha256: Option<String>,
}

/// Configuration errors raised while building a request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No URL was supplied.
    #[error("request URL is empty")]
    EmptyUrl,

    /// The URL could not be parsed or is not http(s).
    #[error("invalid request URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// A header name or value was not valid HTTP.
    #[error("invalid header {name}")]
    InvalidHeader {
        /// The offending header name.
        name: String,
    },
}

/// Immutable request descriptor handed to the engine.
#[derive(Clone)]
pub struct Request {
    id: RequestId,
    url: String,
    method: Method,
    headers: HeaderMap,
    append_headers: bool,
    body: Option<Bytes>,
    read_timeout: Duration,
    connect_timeout: Duration,
    follow_redirects: bool,
    retries: u32,
    retry_interval: Duration,
    cache_time: CacheTime,
    offline_cache: bool,
    connectivity_check: bool,
    connectivity_ping: bool,
    streaming: bool,
    processor_id: ProcessorId,
    download: Option<DownloadTarget>,
    cancelled: Arc<AtomicBool>,
    origin: &'static Location<'static>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("processor_id", &self.processor_id)
            .field("cache_time", &self.cache_time)
            .field("retries", &self.retries)
            .field("cancelled", &self.is_cancelled())
            .field("origin", &format_args!("{}", self.origin))
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Starts a builder seeded with [`EngineConfig::default`] values.
    #[must_use]
    #[track_caller]
    pub fn builder(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::with_origin(url.into(), &EngineConfig::default(), Location::caller())
    }

    /// Starts a builder seeded with values from `config`.
    #[must_use]
    #[track_caller]
    pub fn builder_with(url: impl Into<String>, config: &EngineConfig) -> RequestBuilder {
        RequestBuilder::with_origin(url.into(), config, Location::caller())
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether headers are appended to client defaults instead of replacing them.
    #[must_use]
    pub fn append_headers(&self) -> bool {
        self.append_headers
    }

    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    /// Number of retries after the first attempt.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    #[must_use]
    pub fn cache_time(&self) -> CacheTime {
        self.cache_time
    }

    #[must_use]
    pub fn offline_cache(&self) -> bool {
        self.offline_cache
    }

    #[must_use]
    pub fn connectivity_check(&self) -> bool {
        self.connectivity_check
    }

    #[must_use]
    pub fn connectivity_ping(&self) -> bool {
        self.connectivity_ping
    }

    /// Whether the reply body is handed over as a live stream instead of buffered.
    #[must_use]
    pub fn streaming(&self) -> bool {
        self.streaming
    }

    #[must_use]
    pub fn processor_id(&self) -> ProcessorId {
        self.processor_id
    }

    #[must_use]
    pub fn download(&self) -> Option<&DownloadTarget> {
        self.download.as_ref()
    }

    /// Source location where the request was built.
    #[must_use]
    pub fn origin(&self) -> &'static Location<'static> {
        self.origin
    }

    /// Whether the reply may be looked up in and written to the cache.
    ///
    /// Only GET replies are cached: the cache is keyed by URL alone, a POST
    /// reply depends on its body and a HEAD reply carries no body.
    #[must_use]
    pub fn uses_cache(&self) -> bool {
        self.method == Method::Get && self.cache_time.is_cacheable()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns a copy of this request pointed at a redirect target.
    pub(crate) fn redirected_to(&self, url: String) -> Self {
        let mut next = self.clone();
        next.url = url;
        next
    }
}

/// Builder for [`Request`].
#[derive(Debug)]
pub struct RequestBuilder {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    append_headers: bool,
    body: Option<Bytes>,
    read_timeout: Duration,
    connect_timeout: Duration,
    follow_redirects: bool,
    retries: i32,
    retry_interval: Duration,
    cache_time: CacheTime,
    offline_cache: bool,
    connectivity_check: bool,
    connectivity_ping: bool,
    streaming: bool,
    processor_id: ProcessorId,
    download: Option<DownloadTarget>,
    origin: &'static Location<'static>,
}

impl RequestBuilder {
    fn with_origin(url: String, config: &EngineConfig, origin: &'static Location<'static>) -> Self {
        Self {
            url,
            method: Method::Get,
            headers: Vec::new(),
            append_headers: false,
            body: None,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            follow_redirects: config.follow_redirects,
            retries: config.retry_count,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            cache_time: config.default_cache_time,
            offline_cache: config.offline_caching,
            connectivity_check: config.connectivity_check,
            connectivity_ping: config.connectivity_ping,
            streaming: false,
            processor_id: UNSET_PROCESSOR,
            download: None,
            origin,
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a header. Validated when [`build`](Self::build) runs.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends headers to the client defaults instead of replacing same-named ones.
    #[must_use]
    pub fn append_headers(mut self, append: bool) -> Self {
        self.append_headers = append;
        self
    }

    /// Sets a request body. Only sent for POST.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Sets the retry count. Zero or `-1` disables retries.
    #[must_use]
    pub fn retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn cache_time(mut self, cache_time: CacheTime) -> Self {
        self.cache_time = cache_time;
        self
    }

    #[must_use]
    pub fn offline_cache(mut self, enabled: bool) -> Self {
        self.offline_cache = enabled;
        self
    }

    #[must_use]
    pub fn connectivity_check(mut self, enabled: bool) -> Self {
        self.connectivity_check = enabled;
        self
    }

    #[must_use]
    pub fn connectivity_ping(mut self, enabled: bool) -> Self {
        self.connectivity_ping = enabled;
        self
    }

    /// Hands the body to the processor as a live stream. Streamed replies are not cached.
    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub fn processor(mut self, id: ProcessorId) -> Self {
        self.processor_id = id;
        self
    }

    /// Streams the body to `path` instead of buffering it.
    #[must_use]
    pub fn download_to(mut self, path: impl Into<PathBuf>, expected_sha256: Option<String>) -> Self {
        self.download = Some(DownloadTarget {
            path: path.into(),
            expected_sha256: expected_sha256.map(|s| s.to_ascii_lowercase()),
        });
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] for an empty or non-http(s) URL or an invalid header.
    pub fn build(self) -> Result<Request, RequestError> {
        let url = self.url.trim().to_string();
        if url.is_empty() {
            return Err(RequestError::EmptyUrl);
        }
        let parsed = Url::parse(&url).map_err(|_| RequestError::InvalidUrl { url: url.clone() })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RequestError::InvalidUrl { url });
        }

        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RequestError::InvalidHeader { name: name.clone() })?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|_| RequestError::InvalidHeader { name: name.clone() })?;
            if self.append_headers {
                headers.append(header_name, header_value);
            } else {
                headers.insert(header_name, header_value);
            }
        }

        Ok(Request {
            id: RequestId::next(),
            url,
            method: self.method,
            headers,
            append_headers: self.append_headers,
            body: self.body,
            read_timeout: self.read_timeout,
            connect_timeout: self.connect_timeout,
            follow_redirects: self.follow_redirects,
            retries: u32::try_from(self.retries).unwrap_or(0),
            retry_interval: self.retry_interval,
            cache_time: self.cache_time,
            offline_cache: self.offline_cache,
            connectivity_check: self.connectivity_check,
            connectivity_ping: self.connectivity_ping,
            streaming: self.streaming,
            processor_id: self.processor_id,
            download: self.download,
            cancelled: Arc::new(AtomicBool::new(false)),
            origin: self.origin,
        })
    }
}
