//! Transport defaults (timeouts, retries, redirects).

/// Default connect timeout in milliseconds (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default read timeout in milliseconds (60 seconds).
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 60_000;

/// Default retries after the first attempt.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default delay between attempts in milliseconds.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// Default bound on redirect hops per attempt.
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// Suffix of in-progress download files.
pub const PARTIAL_SUFFIX: &str = "part";
