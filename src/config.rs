//! Engine configuration.
//!
//! [`EngineConfig`] carries the defaults every [`Request`](crate::request::Request)
//! starts from, plus engine-wide sizing. It can be loaded from a flat
//! `key = value` file:
//!
//! ```text
//! # courier.conf
//! read_timeout_ms = 20000
//! retry_count = 2            # -1 disables retries
//! default_cache_ttl_ms = -1  # -1 caches forever, 0 never caches
//! cache_dir = "/var/cache/courier"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::request::CacheTime;
use crate::transport::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_REDIRECTS, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL_MS,
};

/// Default number of concurrent transport attempts.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Maximum number of concurrent transport attempts.
pub const MAX_POOL_SIZE: usize = 64;

/// Default capacity of the in-memory cache tier.
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 64;

/// Default bound on how long a synchronous call waits for the engine binding.
pub const DEFAULT_BINDING_TIMEOUT_MS: u64 = 10_000;

/// Default deferred-queue flush threshold.
pub const DEFAULT_DEFERRED_THRESHOLD: usize = 10;

/// Default cache TTL (one hour).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

const MAX_TIMEOUT_MS: u64 = 3_600_000;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not `key = value`.
    #[error("invalid config syntax on line {line}: expected key = value")]
    Syntax {
        /// 1-based line number.
        line: usize,
    },

    /// A key is not recognized.
    #[error("unknown configuration key '{key}' on line {line}")]
    UnknownKey {
        /// The key.
        key: String,
        /// 1-based line number.
        line: usize,
    },

    /// A value could not be parsed for its key.
    #[error("invalid `{key}` value on line {line}: {reason}")]
    InvalidValue {
        /// The key.
        key: String,
        /// 1-based line number.
        line: usize,
        /// What was expected.
        reason: String,
    },

    /// A value is out of its allowed range.
    #[error("invalid config value for `{key}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// The key.
        key: &'static str,
        /// The rejected value.
        value: String,
        /// The accepted range.
        expected: &'static str,
    },
}

/// Engine-wide configuration and per-request defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Read timeout per attempt, in milliseconds.
    pub read_timeout_ms: u64,
    /// Connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Follow 301/302 redirects.
    pub follow_redirects: bool,
    /// Retries after the first attempt; `-1` disables retries.
    pub retry_count: i32,
    /// Delay between attempts, in milliseconds.
    pub retry_interval_ms: u64,
    /// Cache time applied to requests that do not set one.
    pub default_cache_time: CacheTime,
    /// Mark new cache records as eligible for offline use.
    pub offline_caching: bool,
    /// Check link state before synchronous network attempts.
    pub connectivity_check: bool,
    /// Also ping `ping_url` before synchronous network attempts.
    pub connectivity_ping: bool,
    /// Target of the reachability ping.
    pub ping_url: Option<String>,
    /// Concurrent transport attempts.
    pub pool_size: usize,
    /// Entries held by the in-memory cache tier.
    pub memory_cache_capacity: usize,
    /// How long synchronous calls wait for the engine binding, in milliseconds.
    pub binding_timeout_ms: u64,
    /// Redirect hops allowed per attempt.
    pub max_redirects: u32,
    /// Deferred-queue size that triggers a flush.
    pub deferred_threshold: usize,
    /// Directory holding the record database and blobs.
    pub cache_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            follow_redirects: true,
            retry_count: i32::try_from(DEFAULT_RETRY_COUNT).unwrap_or(0),
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            default_cache_time: CacheTime::Ttl(DEFAULT_CACHE_TTL),
            offline_caching: false,
            connectivity_check: true,
            connectivity_ping: false,
            ping_url: None,
            pool_size: DEFAULT_POOL_SIZE,
            memory_cache_capacity: DEFAULT_MEMORY_CACHE_CAPACITY,
            binding_timeout_ms: DEFAULT_BINDING_TIMEOUT_MS,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            deferred_threshold: DEFAULT_DEFERRED_THRESHOLD,
            cache_dir: PathBuf::from(".courier-cache"),
        }
    }
}

impl EngineConfig {
    /// Loads and validates a config file, starting from defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        parse_config_str(&raw)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout_ms("read_timeout_ms", self.read_timeout_ms)?;
        validate_timeout_ms("connect_timeout_ms", self.connect_timeout_ms)?;
        if self.retry_count < -1 {
            return Err(out_of_range("retry_count", self.retry_count, "-1.."));
        }
        if self.retry_interval_ms > MAX_TIMEOUT_MS {
            return Err(out_of_range(
                "retry_interval_ms",
                self.retry_interval_ms,
                "0..=3600000",
            ));
        }
        if !(1..=MAX_POOL_SIZE).contains(&self.pool_size) {
            return Err(out_of_range("pool_size", self.pool_size, "1..=64"));
        }
        if self.memory_cache_capacity == 0 {
            return Err(out_of_range(
                "memory_cache_capacity",
                self.memory_cache_capacity,
                "1..",
            ));
        }
        validate_timeout_ms("binding_timeout_ms", self.binding_timeout_ms)?;
        if self.deferred_threshold == 0 {
            return Err(out_of_range(
                "deferred_threshold",
                self.deferred_threshold,
                "1..",
            ));
        }
        if self.connectivity_ping && self.ping_url.is_none() {
            return Err(out_of_range(
                "ping_url",
                "<unset>",
                "a URL when connectivity_ping is enabled",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn binding_timeout(&self) -> Duration {
        Duration::from_millis(self.binding_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn validate_timeout_ms(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if (1..=MAX_TIMEOUT_MS).contains(&value) {
        Ok(())
    } else {
        Err(out_of_range(key, value, "1..=3600000"))
    }
}

fn out_of_range(key: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        key,
        value: value.to_string(),
        expected,
    }
}

/// Parses a `key = value` config body over the defaults, then validates it.
///
/// # Errors
///
/// Returns [`ConfigError`] on syntax errors, unknown keys, bad values, or failed validation.
pub fn parse_config_str(raw: &str) -> Result<EngineConfig, ConfigError> {
    let mut cfg = EngineConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax { line: line_no });
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            line: line_no,
            reason: reason.to_string(),
        };

        match key {
            "read_timeout_ms" => cfg.read_timeout_ms = parse_u64(value).map_err(invalid)?,
            "connect_timeout_ms" => cfg.connect_timeout_ms = parse_u64(value).map_err(invalid)?,
            "follow_redirects" => cfg.follow_redirects = parse_boolean(value).map_err(invalid)?,
            "retry_count" => {
                let parsed = parse_i64(value).map_err(invalid)?;
                cfg.retry_count =
                    i32::try_from(parsed).map_err(|_| invalid("integer out of range"))?;
            }
            "retry_interval_ms" => cfg.retry_interval_ms = parse_u64(value).map_err(invalid)?,
            "default_cache_ttl_ms" => {
                cfg.default_cache_time = CacheTime::from_millis(parse_i64(value).map_err(invalid)?);
            }
            "offline_caching" => cfg.offline_caching = parse_boolean(value).map_err(invalid)?,
            "connectivity_check" => {
                cfg.connectivity_check = parse_boolean(value).map_err(invalid)?;
            }
            "connectivity_ping" => cfg.connectivity_ping = parse_boolean(value).map_err(invalid)?,
            "ping_url" => cfg.ping_url = Some(parse_string_literal(value).map_err(invalid)?),
            "pool_size" => cfg.pool_size = parse_usize(value).map_err(invalid)?,
            "memory_cache_capacity" => {
                cfg.memory_cache_capacity = parse_usize(value).map_err(invalid)?;
            }
            "binding_timeout_ms" => cfg.binding_timeout_ms = parse_u64(value).map_err(invalid)?,
            "max_redirects" => {
                let parsed = parse_u64(value).map_err(invalid)?;
                cfg.max_redirects =
                    u32::try_from(parsed).map_err(|_| invalid("integer out of range"))?;
            }
            "deferred_threshold" => cfg.deferred_threshold = parse_usize(value).map_err(invalid)?,
            "cache_dir" => {
                cfg.cache_dir = PathBuf::from(parse_string_literal(value).map_err(invalid)?);
            }
            unknown => {
                return Err(ConfigError::UnknownKey {
                    key: unknown.to_string(),
                    line: line_no,
                });
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String, &'static str> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        return Err("expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_i64(raw_value: &str) -> Result<i64, &'static str> {
    let token = raw_value.trim();
    if token.is_empty() {
        return Err("expected integer value");
    }
    token.parse::<i64>().map_err(|_| "expected integer value")
}

fn parse_u64(raw_value: &str) -> Result<u64, &'static str> {
    let value = parse_i64(raw_value)?;
    u64::try_from(value).map_err(|_| "expected non-negative integer")
}

fn parse_usize(raw_value: &str) -> Result<usize, &'static str> {
    let value = parse_u64(raw_value)?;
    usize::try_from(value).map_err(|_| "integer out of range")
}

fn parse_boolean(raw_value: &str) -> Result<bool, &'static str> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err("expected 'true' or 'false'"),
    }
}
