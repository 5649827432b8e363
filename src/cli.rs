//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use courier_core::EngineConfig;
use courier_core::config::ConfigError;
use courier_core::request::CacheTime;

/// Fetch URLs through a caching, retrying request engine.
///
/// Replies are cached under the cache directory, so repeated runs within the
/// TTL are served without touching the network.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to fetch (read from stdin when omitted)
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Engine configuration file (key = value lines)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding the cache database and blobs
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Cache lifetime in seconds
    #[arg(long, value_name = "SECONDS", conflicts_with = "no_cache")]
    pub ttl: Option<u64>,

    /// Bypass the cache entirely
    #[arg(long)]
    pub no_cache: bool,

    /// Retries after the first attempt (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub retries: Option<u8>,

    /// Read timeout per attempt in milliseconds [default: 60000]
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..=3_600_000))]
    pub read_timeout: Option<u64>,

    /// Connect timeout in milliseconds [default: 30000]
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..=3_600_000))]
    pub connect_timeout: Option<u64>,

    /// Stream replies to files in this directory instead of printing them
    #[arg(long, value_name = "DIR")]
    pub download: Option<PathBuf>,

    /// Parse replies as JSON and pretty-print them
    #[arg(long, conflicts_with = "download")]
    pub json: bool,

    /// Skip the connectivity pre-check
    #[arg(long)]
    pub no_connectivity_check: bool,
}

impl Args {
    /// Loads the configuration file (or defaults) and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or the
    /// resulting configuration fails validation.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };

        if let Some(dir) = &self.cache_dir {
            config.cache_dir.clone_from(dir);
        }
        if self.no_cache {
            config.default_cache_time = CacheTime::NoCache;
        } else if let Some(seconds) = self.ttl {
            config.default_cache_time = if seconds == 0 {
                CacheTime::NoCache
            } else {
                CacheTime::Ttl(Duration::from_secs(seconds))
            };
        }
        if let Some(retries) = self.retries {
            config.retry_count = i32::from(retries);
        }
        if let Some(ms) = self.read_timeout {
            config.read_timeout_ms = ms;
        }
        if let Some(ms) = self.connect_timeout {
            config.connect_timeout_ms = ms;
        }
        if self.no_connectivity_check {
            config.connectivity_check = false;
        }

        config.validate()?;
        Ok(config)
    }
}
